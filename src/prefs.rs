//! Emulator preferences file
//!
//! The web UI edits an [`EmulatorSettings`] JSON document; this module
//! renders it as a Basilisk II prefs file (with the `ipc/` screen mode the
//! streaming build understands) and parses it back. Only the keys the UI
//! owns are modeled; everything else is written as fixed defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::video::Resolution;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmulatorSettings {
    #[serde(default)]
    pub rom: String,
    #[serde(default)]
    pub disks: Vec<String>,
    /// RAM size in megabytes
    #[serde(default = "default_ram")]
    pub ram: u32,
    /// Screen geometry as "<width>x<height>"
    #[serde(default = "default_screen")]
    pub screen: String,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_model")]
    pub model: u32,
    #[serde(default = "default_true")]
    pub fpu: bool,
    #[serde(default = "default_true")]
    pub jit: bool,
    #[serde(default = "default_true")]
    pub sound: bool,
}

fn default_ram() -> u32 {
    32
}
fn default_screen() -> String {
    "800x600".to_string()
}
fn default_cpu() -> u32 {
    4
}
fn default_model() -> u32 {
    14
}
fn default_true() -> bool {
    true
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            rom: String::new(),
            disks: Vec::new(),
            ram: default_ram(),
            screen: default_screen(),
            cpu: default_cpu(),
            model: default_model(),
            fpu: true,
            jit: true,
            sound: true,
        }
    }
}

impl EmulatorSettings {
    /// Parse "800x600"; malformed values fall back to the default geometry
    pub fn screen_size(&self) -> Resolution {
        let mut parts = self.screen.splitn(2, 'x');
        let width = parts.next().and_then(|p| p.parse().ok());
        let height = parts.next().and_then(|p| p.parse().ok());
        match (width, height) {
            (Some(w), Some(h)) => Resolution::new(w, h),
            _ => Resolution::SVGA,
        }
    }
}

/// Render the settings as a prefs file the emulator accepts
pub fn write_prefs(
    settings: &EmulatorSettings,
    prefs_path: &Path,
    roms_dir: &Path,
    images_dir: &Path,
) -> Result<()> {
    let screen = settings.screen_size();
    let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let absolute = |dir: &Path, name: &str| {
        if dir.is_absolute() {
            dir.join(name)
        } else {
            cwd.join(dir).join(name)
        }
    };

    let mut prefs = String::new();
    prefs.push_str("# Basilisk II preferences - generated by web UI\n\n");

    if !settings.rom.is_empty() {
        prefs.push_str(&format!(
            "rom {}\n",
            absolute(roms_dir, &settings.rom).display()
        ));
    }
    for disk in &settings.disks {
        prefs.push_str(&format!(
            "disk {}\n",
            absolute(images_dir, disk).display()
        ));
    }

    prefs.push_str("\n# Hardware settings\n");
    prefs.push_str(&format!("ramsize {}\n", settings.ram * 1024 * 1024));
    prefs.push_str(&format!("screen ipc/{}/{}\n", screen.width, screen.height));
    prefs.push_str(&format!("cpu {}\n", settings.cpu));
    prefs.push_str(&format!("modelid {}\n", settings.model));
    prefs.push_str(&format!("fpu {}\n", settings.fpu));
    prefs.push_str(&format!("jit {}\n", settings.jit));
    prefs.push_str(&format!("nosound {}\n", !settings.sound));

    prefs.push_str("\n# Display settings\n");
    prefs.push_str("displaycolordepth 0\n");
    prefs.push_str("frameskip 0\n");

    prefs.push_str("\n# Input settings\n");
    prefs.push_str("keycodes false\n");
    prefs.push_str("mousewheelmode 1\n");
    prefs.push_str("swap_opt_cmd true\n");

    prefs.push_str("\n# System settings\n");
    prefs.push_str("ignoresegv true\n");
    prefs.push_str("idlewait true\n");
    prefs.push_str("nogui true\n");
    prefs.push_str("bootdrive 0\n");
    prefs.push_str("nocdrom false\n");

    std::fs::write(prefs_path, prefs)
        .map_err(|e| AppError::Config(format!("write '{}' failed: {}", prefs_path.display(), e)))?;
    tracing::info!("Wrote prefs file {}", prefs_path.display());
    Ok(())
}

/// Parse a prefs file back into the settings the UI edits
pub fn read_prefs(prefs_path: &Path) -> Result<EmulatorSettings> {
    let text = std::fs::read_to_string(prefs_path)
        .map_err(|_| AppError::NotFound(format!("no config file at {}", prefs_path.display())))?;

    let mut settings = EmulatorSettings::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let value = value.trim();

        match key {
            "rom" => settings.rom = basename(value),
            "disk" => settings.disks.push(basename(value)),
            "ramsize" => {
                if let Ok(bytes) = value.parse::<u64>() {
                    settings.ram = (bytes / (1024 * 1024)) as u32;
                }
            }
            "screen" => {
                // "ipc/800/600" or "win/800/600"
                let mut parts = value.split('/');
                let _driver = parts.next();
                if let (Some(w), Some(h)) = (parts.next(), parts.next()) {
                    if w.parse::<u32>().is_ok() && h.parse::<u32>().is_ok() {
                        settings.screen = format!("{}x{}", w, h);
                    }
                }
            }
            "cpu" => settings.cpu = value.parse().unwrap_or(settings.cpu),
            "modelid" => settings.model = value.parse().unwrap_or(settings.model),
            "fpu" => settings.fpu = value == "true",
            "jit" => settings.jit = value == "true",
            "nosound" => settings.sound = value != "true",
            _ => {}
        }
    }

    Ok(settings)
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_prefs(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("macemu-prefs-{}-{}.prefs", tag, std::process::id()))
    }

    #[test]
    fn settings_round_trip_through_the_prefs_file() {
        let settings = EmulatorSettings {
            rom: "q900.rom".to_string(),
            disks: vec!["system.img".to_string(), "apps.dsk".to_string()],
            ram: 64,
            screen: "1024x768".to_string(),
            cpu: 4,
            model: 14,
            fpu: true,
            jit: false,
            sound: false,
        };

        let path = temp_prefs("roundtrip");
        write_prefs(
            &settings,
            &path,
            Path::new("storage/roms"),
            Path::new("storage/images"),
        )
        .unwrap();

        let parsed = read_prefs(&path).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn screen_mode_is_written_as_ipc() {
        let path = temp_prefs("ipc");
        write_prefs(
            &EmulatorSettings::default(),
            &path,
            Path::new("roms"),
            Path::new("images"),
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("screen ipc/800/600"));
        assert!(text.contains("nogui true"));
    }

    #[test]
    fn malformed_screen_falls_back_to_default_geometry() {
        let settings = EmulatorSettings {
            screen: "banana".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.screen_size(), Resolution::SVGA);

        let settings = EmulatorSettings {
            screen: "1024x768".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.screen_size(), Resolution::new(1024, 768));
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(read_prefs(Path::new("/nonexistent/x.prefs")).is_err());
    }
}
