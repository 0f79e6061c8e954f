//! General utility functions

/// Initialize env_logger with a compact single-line format.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn logging() {
    use std::io::Write;

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let color = match record.level() {
                log::Level::Error => "\x1b[91m",
                log::Level::Warn => "\x1b[93m",
                _ => "\x1b[90m",
            };
            writeln!(
                buf,
                "{}[{:5} {}:{}] {}\x1b[0m",
                color,
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .try_init();

    std::panic::set_hook(Box::new(|info| {
        log::error!("{info}\n{}", std::backtrace::Backtrace::capture());
    }));
}

/// Retries the condition up to `n` times, pausing in between.
/// Returns whether the condition became true.
pub fn spin_wait(n: usize, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..n {
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    false
}

/// Simple bare bones random number generator based on wyhash.
///
/// - See <https://github.com/wangyi-fudan/wyhash>
pub struct WyRand {
    pub seed: u64,
}

impl WyRand {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
    pub fn gen(&mut self) -> u64 {
        self.seed = self.seed.wrapping_add(0xa076_1d64_78bd_642f);
        let t: u128 = (self.seed as u128).wrapping_mul((self.seed ^ 0xe703_7ed1_a0b4_28db) as u128);
        (t.wrapping_shr(64) ^ t) as u64
    }
    pub fn range(&mut self, range: core::ops::Range<u64>) -> u64 {
        let mut val = self.gen();
        if range.start < range.end {
            val %= range.end - range.start;
            val + range.start
        } else {
            0
        }
    }
}
