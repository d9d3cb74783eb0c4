//! Progress reporting for long batch runs

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar counting records through a batch engine.
///
/// Hidden unless `visible` is set, so library callers and tests stay quiet.
pub fn create_record_progress(total: u64, message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Successful operations per second over `elapsed`.
pub fn throughput(succeeded: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        succeeded as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(100, Duration::from_secs(4)), 25.0);
        assert_eq!(throughput(100, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_hidden_progress() {
        let pb = create_record_progress(10, "Upserting", false);
        assert!(pb.is_hidden());
        pb.inc(3);
        assert_eq!(pb.position(), 3);
    }
}
