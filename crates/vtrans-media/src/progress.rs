//! FFmpeg progress parsing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Progress information from an encode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeProgress {
    /// Current frame number
    pub frame: u64,
    /// Current FPS
    pub fps: f64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Source duration in milliseconds, when known
    pub total_ms: Option<i64>,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl EncodeProgress {
    /// Progress percentage, when the source duration is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_ms {
            Some(total) if total > 0 => {
                Some(((self.out_time_ms as f64 / total as f64) * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    /// Estimate time remaining in seconds.
    pub fn eta_seconds(&self) -> Option<f64> {
        let total = self.total_ms?;
        if self.speed <= 0.0 || self.out_time_ms <= 0 {
            return None;
        }

        let remaining_ms = total - self.out_time_ms;
        if remaining_ms <= 0 {
            return Some(0.0);
        }
        Some((remaining_ms as f64 / 1000.0) / self.speed)
    }

    /// Apply one `key=value` line of `-progress` output.
    ///
    /// Returns a snapshot when the line closes a progress block.
    pub fn apply_line(&mut self, line: &str) -> Option<EncodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "out_time_us" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_ms = us / 1000;
                }
            }
            // Despite the name, ffmpeg reports microseconds here too
            "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_ms = us / 1000;
                }
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    self.fps = fps;
                }
            }
            "speed" => {
                if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                    self.speed = speed;
                }
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                }
                return Some(self.clone());
            }
            _ => {}
        }
        None
    }
}

/// Callback type for progress updates.
pub type ProgressCallback = Arc<dyn Fn(EncodeProgress) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_parsing() {
        let mut progress = EncodeProgress::default();

        assert!(progress.apply_line("out_time_us=5000000").is_none());
        assert_eq!(progress.out_time_ms, 5000);

        progress.apply_line("speed=1.5x");
        assert!((progress.speed - 1.5).abs() < 0.01);
        progress.apply_line("speed=N/A");
        assert!((progress.speed - 1.5).abs() < 0.01);

        let snapshot = progress.apply_line("progress=continue").unwrap();
        assert!(!snapshot.is_complete);
        let snapshot = progress.apply_line("progress=end").unwrap();
        assert!(snapshot.is_complete);
    }

    #[test]
    fn test_percentage_and_eta() {
        let progress = EncodeProgress {
            out_time_ms: 5000,
            speed: 2.0,
            total_ms: Some(10000),
            ..Default::default()
        };

        assert!((progress.percentage().unwrap() - 50.0).abs() < 0.01);
        // 5 seconds remaining at 2x speed
        assert!((progress.eta_seconds().unwrap() - 2.5).abs() < 0.01);

        let unknown = EncodeProgress::default();
        assert!(unknown.percentage().is_none());
        assert!(unknown.eta_seconds().is_none());
    }
}
