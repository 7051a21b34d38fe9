//----------------------------------------------------------------------------------------------
// Module platform
// Monotonic 64 bit ns clock and small timing helpers
// The clock epoch is the first call, so 32 bit DAQ timestamps start near zero

use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

static CLOCK_EPOCH: OnceCell<Instant> = OnceCell::new();

/// Initialize the clock epoch
/// Optional, the first call to clock_get64 initializes it as well
pub fn clock_init() {
    CLOCK_EPOCH.get_or_init(Instant::now);
}

/// Get the monotonic clock in ns since the process clock epoch
pub fn clock_get64() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Sleep with ns resolution granularity of the OS scheduler
pub fn sleep_ns(ns: u64) {
    std::thread::sleep(Duration::from_nanos(ns));
}

/// Sleep milliseconds
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        clock_init();
        let t1 = clock_get64();
        sleep_ns(1000_000);
        let t2 = clock_get64();
        assert!(t2 > t1);
        assert!(t2 - t1 >= 1000_000);
    }
}
