//! TSC clock plumbing: cycle counter access, frequency measurement, and
//! cycle/time conversions used by the timing wheel and the management
//! retransmit sweep.

use std::time::{Duration, Instant};

/// Read the CPU cycle counter.
///
/// On non-x86 targets this falls back to monotonic nanoseconds, which the
/// conversion helpers treat as a 1 GHz clock.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the TSC frequency in GHz against the monotonic clock.
///
/// Spins for a few milliseconds; intended to run once per process (the
/// Nexus does this at startup and shares the result).
pub fn measure_rdtsc_freq() -> f64 {
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    while wall_start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(tsc_start);
    let nanos = wall_start.elapsed().as_nanos() as f64;
    cycles as f64 / nanos
}

/// Convert cycles to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e9)
}

/// Convert cycles to milliseconds.
#[inline]
pub fn to_msec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e6)
}

/// Convert cycles to microseconds.
#[inline]
pub fn to_usec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e3)
}

/// Convert microseconds to cycles.
#[inline]
pub fn us_to_cycles(us: f64, freq_ghz: f64) -> u64 {
    (us * freq_ghz * 1e3) as u64
}

/// Convert milliseconds to cycles.
#[inline]
pub fn ms_to_cycles(ms: u64, freq_ghz: f64) -> u64 {
    (ms as f64 * freq_ghz * 1e6) as u64
}
