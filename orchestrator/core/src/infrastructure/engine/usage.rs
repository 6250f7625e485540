// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CPU and resident memory of an engine process, read from `/proc`.
//!
//! CPU percentage is the share of one core used since the previous sample,
//! so the first sample of a process reports `0.0`.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub rss_mb: f64,
}

#[derive(Debug, Default)]
pub struct UsageSampler {
    last: Option<(u64, Instant)>,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    pub fn sample(&mut self, pid: u32) -> Option<ResourceUsage> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let ticks = cpu_ticks(&stat)?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;

        // SAFETY: sysconf has no preconditions
        let (ticks_per_sec, page_size) = unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
        if ticks_per_sec <= 0 || page_size <= 0 {
            return None;
        }

        let now = Instant::now();
        let cpu_pct = match self.last {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    let used = ticks.saturating_sub(prev_ticks) as f64 / ticks_per_sec as f64;
                    (used / elapsed * 100.0 * 10.0).round() / 10.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((ticks, now));

        let rss_mb = (rss_pages * page_size as u64) as f64 / (1024.0 * 1024.0);
        Some(ResourceUsage {
            cpu_pct,
            rss_mb: (rss_mb * 10.0).round() / 10.0,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn sample(&mut self, _pid: u32) -> Option<ResourceUsage> {
        None
    }
}

/// `utime + stime` from `/proc/<pid>/stat`. The command name may contain
/// spaces, so fields are counted from the closing parenthesis.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_ticks_handles_spaces_in_name() {
        let stat = "4242 (node red) S 1 4242 4242 0 -1 4194560 1000 0 0 0 150 50 0 0 20 0 11 0 100 0 0";
        assert_eq!(cpu_ticks(stat), Some(200));
        assert_eq!(cpu_ticks("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_samples_own_process() {
        let mut sampler = UsageSampler::new();
        let usage = sampler.sample(std::process::id()).unwrap();
        assert!(usage.rss_mb > 0.0);
        assert_eq!(usage.cpu_pct, 0.0);
        assert!(sampler.sample(std::process::id()).is_some());
        assert!(UsageSampler::new().sample(u32::MAX).is_none());
    }
}
