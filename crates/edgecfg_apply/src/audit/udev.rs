//! Ownership audit of raw cache devices named in the udev rules file.
//!
//! Only ever produces warnings: a device that is owned by the wrong user or
//! that carries a mounted ext4 filesystem is worth a look, not a failed run.

use nix::unistd::User;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// File name of the generated udev rules
pub const UDEV_RULES_NAME: &str = "50-ats.rules";

#[derive(Debug, Clone)]
pub struct UdevAudit {
    pub dev_dir: PathBuf,
    pub ext4_dir: PathBuf,
}

impl Default for UdevAudit {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            ext4_dir: PathBuf::from("/proc/fs/ext4"),
        }
    }
}

impl UdevAudit {
    /// Warnings for every `KERNEL=="dev", OWNER="user"` rule that does not hold on this host
    pub fn check(&self, body: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        let ext4_devices = self.ext4_devices();

        for line in body.lines() {
            if !line.contains("KERNEL==") {
                continue;
            }
            let vals: Vec<&str> = line.split('"').collect();
            if vals.len() < 4 {
                warnings.push(format!("malformed udev rule: {}", line.trim()));
                continue;
            }
            let device = vals[1];
            let owner = vals[3];
            if owner == "root" {
                continue;
            }

            let user = match User::from_name(owner) {
                Ok(Some(user)) => user,
                _ => {
                    warnings.push(format!(
                        "udev rule owner '{}' for device {} does not exist",
                        owner, device
                    ));
                    continue;
                }
            };

            let dev_path = self.dev_dir.join(device);
            match fs::metadata(&dev_path) {
                Ok(meta) if meta.uid() != user.uid.as_raw() => warnings.push(format!(
                    "device {} is owned by uid {}, expected {} ({})",
                    dev_path.display(),
                    meta.uid(),
                    user.uid.as_raw(),
                    owner
                )),
                Ok(_) => {}
                Err(e) => warnings.push(format!(
                    "cannot stat device {}: {}",
                    dev_path.display(),
                    e
                )),
            }

            for fs_dev in &ext4_devices {
                if device.starts_with(fs_dev.as_str()) {
                    warnings.push(format!(
                        "device {} holds an ext4 filesystem ({}) but is assigned to the cache",
                        device, fs_dev
                    ));
                }
            }
        }
        warnings
    }

    fn ext4_devices(&self) -> Vec<String> {
        match fs::read_dir(&self.ext4_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
