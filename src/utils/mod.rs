//! Utility functions for OCT-SSM

mod imaging;
#[cfg(feature = "viz")]
mod viz;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub use imaging::{panel_image, save_grayscale, save_progress_panel, to_gray_image};
#[cfg(feature = "viz")]
pub use viz::plot_history;

/// Create the parent directory of `path` if it has one
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Save object to JSON file
pub fn save_json<T: Serialize>(obj: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, obj)?;
    writer.flush()?;
    Ok(())
}

/// Load object from JSON file
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    Ok(serde_json::from_reader(reader)?)
}

/// Timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer, logs its elapsed time when dropped
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start new timer
        pub fn new(name: &str) -> Self {
            Timer {
                start: Instant::now(),
                name: name.to_string(),
            }
        }

        /// Get elapsed time in seconds
        pub fn elapsed(&self) -> f32 {
            self.start.elapsed().as_secs_f32()
        }

        /// Elapsed time as a duration
        pub fn duration(&self) -> Duration {
            self.start.elapsed()
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            log::debug!("{}: {:.3}s", self.name, self.elapsed());
        }
    }
}

/// Progress tracking
pub mod progress {
    use std::io::{self, Write};

    /// Single-line progress bar on stderr with a `key=value` postfix
    pub struct ProgressBar {
        desc: String,
        total: usize,
        current: usize,
        width: usize,
        postfix: Vec<(String, f32)>,
        visible: bool,
    }

    impl ProgressBar {
        /// Create new progress bar
        pub fn new(desc: impl Into<String>, total: usize) -> Self {
            ProgressBar {
                desc: desc.into(),
                total,
                current: 0,
                width: 30,
                postfix: Vec::new(),
                visible: true,
            }
        }

        /// Progress bar that tracks state without drawing
        pub fn hidden(desc: impl Into<String>, total: usize) -> Self {
            ProgressBar {
                visible: false,
                ..ProgressBar::new(desc, total)
            }
        }

        /// Replace the values shown after the bar
        pub fn set_postfix(&mut self, values: &[(&str, f32)]) {
            self.postfix = values.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        }

        /// Increment progress
        pub fn inc(&mut self) {
            self.current = (self.current + 1).min(self.total);
            self.display();
        }

        /// Items completed
        pub fn position(&self) -> usize {
            self.current
        }

        /// Rendered bar without the carriage return
        pub fn render(&self) -> String {
            let progress = if self.total == 0 {
                1.0
            } else {
                self.current as f32 / self.total as f32
            };
            let filled = ((progress * self.width as f32) as usize).min(self.width);
            let postfix = self
                .postfix
                .iter()
                .map(|(k, v)| format!("{}={:.6}", k, v))
                .collect::<Vec<_>>()
                .join(", ");

            format!(
                "{}: [{}{}] {}/{} {}",
                self.desc,
                "=".repeat(filled),
                " ".repeat(self.width - filled),
                self.current,
                self.total,
                postfix
            )
        }

        fn display(&self) {
            if !self.visible {
                return;
            }
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "\r{}", self.render());
            if self.current >= self.total {
                let _ = writeln!(stderr);
            }
            let _ = stderr.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_serialization() {
        let dir = std::env::temp_dir().join(format!("oct_ssm_json_{}", std::process::id()));
        let path = dir.join("nested").join("values.json");
        let mut values = BTreeMap::new();
        values.insert("psnr".to_string(), 21.5f32);

        save_json(&values, &path).unwrap();
        let loaded: BTreeMap<String, f32> = load_json(&path).unwrap();
        assert_eq!(values, loaded);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_json_missing_file() {
        let result: Result<BTreeMap<String, f32>> = load_json("/nonexistent/oct_ssm.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_progress_render() {
        let mut bar = progress::ProgressBar::hidden("Train Epoch 1/2", 4);
        bar.inc();
        bar.inc();
        bar.set_postfix(&[("loss", 0.5)]);
        let line = bar.render();
        assert!(line.starts_with("Train Epoch 1/2: ["));
        assert!(line.contains("2/4"));
        assert!(line.ends_with("loss=0.500000"));

        for _ in 0..10 {
            bar.inc();
        }
        assert_eq!(bar.position(), 4);
    }
}
