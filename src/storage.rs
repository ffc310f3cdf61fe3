//! ROM and disk-image discovery
//!
//! ROMs are scanned recursively and tagged with the big-endian first word
//! of the file, which the client UI uses to recognize known machine ROMs.
//! Disk images are scanned flat. Results are sorted by name.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;

const ROM_EXTENSIONS: &[&str] = &["rom"];
const DISK_EXTENSIONS: &[&str] = &["img", "dsk", "hfv", "iso", "toast"];

#[derive(Debug, Clone, Serialize)]
pub struct RomInfo {
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    #[serde(rename = "romsPath")]
    pub roms_path: String,
    #[serde(rename = "imagesPath")]
    pub images_path: String,
    pub roms: Vec<RomInfo>,
    pub disks: Vec<DiskInfo>,
}

/// Scan both storage trees. Missing directories yield empty lists.
pub fn scan_storage(roms_path: &Path, images_path: &Path) -> StorageInfo {
    let mut roms = Vec::new();
    scan_roms(roms_path, "", &mut roms);
    roms.sort_by(|a, b| a.name.cmp(&b.name));

    let mut disks = scan_disks(images_path);
    disks.sort_by(|a, b| a.name.cmp(&b.name));

    StorageInfo {
        roms_path: roms_path.to_string_lossy().into_owned(),
        images_path: images_path.to_string_lossy().into_owned(),
        roms,
        disks,
    }
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| extensions.contains(&e.as_str()))
}

/// Big-endian first word of the file, rendered as 8 hex digits
fn rom_checksum(path: &Path) -> String {
    let mut word = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut word)) {
        Ok(()) => format!("{:08x}", u32::from_be_bytes(word)),
        Err(_) => "00000000".to_string(),
    }
}

fn scan_roms(base: &Path, relative: &str, out: &mut Vec<RomInfo>) {
    let dir = if relative.is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    };
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let rel_name = if relative.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", relative, name)
        };
        let Ok(meta) = entry.metadata() else { continue };

        if meta.is_dir() {
            scan_roms(base, &rel_name, out);
        } else if meta.is_file() && has_extension(&name, ROM_EXTENSIONS) {
            out.push(RomInfo {
                checksum: rom_checksum(&entry.path()),
                size: meta.len(),
                name: rel_name,
            });
        }
    }
}

fn scan_disks(dir: &Path) -> Vec<DiskInfo> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !has_extension(&name, DISK_EXTENSIONS) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            out.push(DiskInfo {
                size: meta.len(),
                name,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_tree(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("macemu-storage-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(path: &Path, bytes: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn roms_are_found_recursively_with_checksums() {
        let dir = temp_tree("roms");
        fs::create_dir_all(dir.join("quadra")).unwrap();
        write_file(&dir.join("quadra/q900.rom"), &[0x3D, 0xC2, 0x78, 0x23, 0, 0]);
        write_file(&dir.join("old.ROM"), &[0x97, 0x85, 0x1D, 0xB6, 1, 2]);
        write_file(&dir.join("notes.txt"), b"not a rom");
        write_file(&dir.join(".hidden.rom"), &[0; 8]);

        let info = scan_storage(&dir, &dir);
        assert_eq!(info.roms.len(), 2);
        assert_eq!(info.roms[0].name, "old.ROM");
        assert_eq!(info.roms[0].checksum, "97851db6");
        assert_eq!(info.roms[1].name, "quadra/q900.rom");
        assert_eq!(info.roms[1].checksum, "3dc27823");
    }

    #[test]
    fn disks_are_scanned_flat_and_sorted() {
        let dir = temp_tree("disks");
        write_file(&dir.join("system.img"), &[0u8; 32]);
        write_file(&dir.join("apps.dsk"), &[0u8; 16]);
        fs::create_dir_all(dir.join("nested")).unwrap();
        write_file(&dir.join("nested/deep.img"), &[0u8; 8]);

        let info = scan_storage(&dir, &dir);
        let names: Vec<&str> = info.disks.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["apps.dsk", "system.img"]);
        assert_eq!(info.disks[1].size, 32);
    }

    #[test]
    fn missing_directories_yield_empty_lists() {
        let ghost = Path::new("/nonexistent/macemu-storage");
        let info = scan_storage(ghost, ghost);
        assert!(info.roms.is_empty());
        assert!(info.disks.is_empty());
    }
}
