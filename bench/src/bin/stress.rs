//! Randomized configuration stress against a software-modeled device.
//!
//! Repeatedly builds scheduling domains, churns queue→port mappings, starts
//! the domains, and resets them, checking that every cycle returns the
//! device to its initial resource counts.

use clap::Parser;
use log::info;

use wda::util::{logging, WyRand};
use wda::{
    Completion, CreateDomainArgs, CreateLdbPortArgs, CreateLdbQueueArgs, MapQidArgs, Owner,
    ShadowRegs, UnmapQidArgs,
};

/// Benchmark the domain lifecycle and mapping paths.
#[derive(Parser, Debug)]
#[command(about, version, author)]
struct Args {
    /// Number of create/map/reset cycles.
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,
    /// RNG seed.
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
}

fn main() {
    logging();
    let args = Args::parse();
    info!("{args:?}");

    let dev = wda::Device::new(ShadowRegs::new());
    let mut rng = WyRand::new(args.seed);

    let baseline = dev.num_resources(Owner::Pf).unwrap();

    for iter in 0..args.iterations {
        let num_queues = rng.range(1..5) as u32;
        let num_ports = rng.range(1..5) as u32;

        let domain = dev
            .create_sched_domain(
                Owner::Pf,
                &CreateDomainArgs {
                    num_ldb_queues: num_queues,
                    num_ldb_ports: num_ports,
                    num_dir_ports: rng.range(0..3) as u32,
                    num_hist_list_entries: 8 * num_ports,
                    num_ldb_credits: rng.range(0..256) as u32,
                    num_dir_credits: rng.range(0..64) as u32,
                    ..Default::default()
                },
            )
            .expect("create domain");

        let queues: Vec<u32> = (0..num_queues)
            .map(|_| {
                dev.create_ldb_queue(Owner::Pf, domain, &CreateLdbQueueArgs::default())
                    .expect("create queue")
            })
            .collect();
        let ports: Vec<u32> = (0..num_ports)
            .map(|_| {
                dev.create_ldb_port(
                    Owner::Pf,
                    domain,
                    &CreateLdbPortArgs {
                        cq_depth: 8,
                        cq_history_list_size: 8,
                        ..Default::default()
                    },
                    0x4000,
                )
                .expect("create port")
            })
            .collect();

        // Map every queue somewhere, then churn priorities and mappings.
        for (i, &qid) in queues.iter().enumerate() {
            let args = MapQidArgs {
                port_id: ports[i % ports.len()],
                qid,
                priority: rng.range(0..8) as u8,
            };
            assert_eq!(dev.map_qid(Owner::Pf, domain, &args), Ok(Completion::Immediate));
        }

        dev.start_domain(Owner::Pf, domain).expect("start domain");

        for _ in 0..rng.range(0..8) {
            let qid = queues[rng.range(0..queues.len() as u64) as usize];
            let port_id = ports[rng.range(0..ports.len() as u64) as usize];
            let priority = rng.range(0..8) as u8;
            match rng.range(0..2) {
                0 => {
                    let args = MapQidArgs {
                        port_id,
                        qid,
                        priority,
                    };
                    dev.map_qid(Owner::Pf, domain, &args).expect("map");
                }
                _ => {
                    let args = UnmapQidArgs { port_id, qid };
                    // Unmapping a queue that is not on this port is an
                    // ordinary caller error.
                    let _ = dev.unmap_qid(Owner::Pf, domain, &args);
                }
            }
        }

        dev.reset_domain(Owner::Pf, domain).expect("reset domain");

        let now = dev.num_resources(Owner::Pf).unwrap();
        assert_eq!(now, baseline, "resource leak after iteration {iter}");
    }

    info!("{} cycles ok", args.iterations);
}
