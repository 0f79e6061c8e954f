//! PF ↔ vdev partitioning round-trips.
//!
//! Randomly re-partitions every resource class across a set of vdevs and
//! checks the conservation law after each step: available PF resources plus
//! available vdev resources always sum to the device table sizes.

use clap::Parser;
use log::info;

use wda::util::{logging, WyRand};
use wda::{Device, Owner, ShadowRegs, VdevId};

#[derive(Parser, Debug)]
#[command(about, version, author)]
struct Args {
    /// Number of repartitioning rounds.
    #[arg(short, long, default_value_t = 1000)]
    rounds: usize,
    /// Number of vdevs to juggle.
    #[arg(short, long, default_value_t = 4)]
    vdevs: usize,
    /// RNG seed.
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
}

fn check_conservation(dev: &Device<ShadowRegs>, vdevs: usize) {
    let mut total = dev.num_resources(Owner::Pf).unwrap();
    for v in 0..vdevs {
        let n = dev.num_resources(Owner::Vdev(VdevId(v))).unwrap();
        total.num_sched_domains += n.num_sched_domains;
        total.num_ldb_queues += n.num_ldb_queues;
        total.num_ldb_ports += n.num_ldb_ports;
        total.num_dir_ports += n.num_dir_ports;
        total.num_ldb_credits += n.num_ldb_credits;
        total.num_dir_credits += n.num_dir_credits;
        total.num_hist_list_entries += n.num_hist_list_entries;
        total.num_atomic_inflights += n.num_atomic_inflights;
    }

    assert_eq!(total.num_sched_domains as usize, wda::MAX_DOMAINS);
    assert_eq!(total.num_ldb_queues as usize, wda::MAX_LDB_QUEUES);
    assert_eq!(total.num_ldb_ports as usize, wda::MAX_LDB_PORTS);
    assert_eq!(total.num_dir_ports as usize, wda::MAX_DIR_PAIRS);
    assert_eq!(total.num_ldb_credits, wda::MAX_LDB_CREDITS);
    assert_eq!(total.num_dir_credits, wda::MAX_DIR_CREDITS);
    assert_eq!(total.num_hist_list_entries as usize, wda::MAX_HIST_LIST_ENTRIES);
    assert_eq!(total.num_atomic_inflights, wda::MAX_ATM_INFLIGHTS);
}

fn main() {
    logging();
    let args = Args::parse();
    info!("{args:?}");
    assert!(args.vdevs <= wda::MAX_VDEVS);

    let dev = Device::new(ShadowRegs::new());
    let mut rng = WyRand::new(args.seed);

    for round in 0..args.rounds {
        let v = VdevId(rng.range(0..args.vdevs as u64) as usize);

        // Transfers against a locked assignment must fail and change
        // nothing; everything else is a legal resize.
        let locked = dev.vdev_is_locked(v);

        let ret = match rng.range(0..8) {
            0 => dev.update_vdev_sched_domains(v, rng.range(0..8) as u32),
            1 => dev.update_vdev_ldb_queues(v, rng.range(0..16) as u32),
            2 => dev.update_vdev_ldb_ports(v, rng.range(0..32) as u32),
            3 => dev.update_vdev_dir_ports(v, rng.range(0..32) as u32),
            4 => dev.update_vdev_ldb_credits(v, rng.range(0..4096) as u32),
            5 => dev.update_vdev_dir_credits(v, rng.range(0..1024) as u32),
            6 => dev.update_vdev_hist_list_entries(v, rng.range(0..1024) as u32),
            _ => dev.update_vdev_atomic_inflights(v, rng.range(0..1024) as u32),
        };
        if locked {
            assert!(ret.is_err(), "transfer against locked vdev {} passed", v.0);
        }

        // Occasionally flip the lock state.
        match rng.range(0..16) {
            0 => dev.lock_vdev(v).unwrap(),
            1 => dev.unlock_vdev(v).unwrap(),
            _ => {}
        }

        check_conservation(&dev, args.vdevs);

        if round % 100 == 99 {
            info!("round {} ok", round + 1);
        }
    }

    // Full unwind: every pool back to the PF.
    for v in 0..args.vdevs {
        let v = VdevId(v);
        dev.unlock_vdev(v).unwrap();
        dev.reset_vdev_resources(v).unwrap();
    }
    let n = dev.num_resources(Owner::Pf).unwrap();
    assert_eq!(n.num_ldb_queues as usize, wda::MAX_LDB_QUEUES);
    assert_eq!(n.num_hist_list_entries as usize, wda::MAX_HIST_LIST_ENTRIES);

    info!("{} rounds ok", args.rounds);
}
