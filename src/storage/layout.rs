//! Fixed partition layout and device naming.
//!
//! Every target device gets the same GPT layout:
//!
//! | # | size   | content                         |
//! |---|--------|---------------------------------|
//! | 1 | 1 MiB  | BIOS boot (GRUB core image)     |
//! | 2 | 200 MiB| EFI system partition            |
//! | 3 | 1 GiB  | `/boot` (ext4)                  |
//! | 4 | rest   | root (btrfs, optionally on LUKS)|
//!
//! With a mirror device, partitions 2 and 3 carry the Linux RAID type and
//! are assembled into RAID1 arrays.

use camino::{Utf8Path, Utf8PathBuf};
use strum::{AsRefStr, Display};

const BIOS_BOOT_TYPE: &str = "21686148-6449-6E6F-744E-656564454649";
const ESP_TYPE: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const LINUX_FS_TYPE: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
const LINUX_RAID_TYPE: &str = "A19D880F-05FC-4D3B-A006-743F0F84911E";

/// Filesystems of the stack, named as in the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum FsRole {
    Boot,
    BootEfi,
    Root,
}

impl FsRole {
    /// Partition number holding this filesystem (or its RAID member).
    pub fn partition_number(self) -> u32 {
        match self {
            Self::BootEfi => 2,
            Self::Boot => 3,
            Self::Root => 4,
        }
    }
}

/// The `sfdisk` script for one device.
pub fn sfdisk_script(mirrored: bool) -> String {
    let (esp_type, boot_type) = if mirrored {
        (LINUX_RAID_TYPE, LINUX_RAID_TYPE)
    } else {
        (ESP_TYPE, LINUX_FS_TYPE)
    };
    format!(
        "label: gpt\n\
        size=1MiB, type={}\n\
        size=200MiB, type={}\n\
        size=1GiB, type={}\n\
        type={}\n",
        BIOS_BOOT_TYPE, esp_type, boot_type, LINUX_FS_TYPE
    )
}

/// Returns the device node of partition `number` on `device`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) use a
/// `p` separator.
pub fn partition_path(device: &Utf8Path, number: u32) -> Utf8PathBuf {
    let separator = if device.as_str().ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    Utf8PathBuf::from(format!("{}{}{}", device, separator, number))
}

/// Returns true if `sfdisk --list` output shows partitions of `device`.
pub fn has_partitions(listing: &str, device: &Utf8Path) -> bool {
    listing.lines().any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|word| word != device.as_str() && word.starts_with(device.as_str()))
    })
}

/// Device node of the RAID1 array for `role`.
pub fn raid_device(role: FsRole) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/dev/md/new-{}", role))
}

/// Name of the LUKS mapping over the root partition of device `index`.
pub fn mapping_name(index: usize) -> String {
    format!("new-root-{}", index)
}

/// Device node of an open LUKS mapping.
pub fn mapping_path(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/dev/mapper/{}", name))
}

/// Device node through which udev exposes a filesystem or LUKS UUID.
pub fn by_uuid_path(uuid: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/dev/disk/by-uuid/{}", uuid))
}

/// Splits a generated UUID into the FAT volume id given to `mkfs.vfat -i`
/// and the `XXXX-XXXX` form under which the filesystem shows up.
pub fn vfat_volume_id(uuid: &uuid::Uuid) -> (String, String) {
    let id = uuid.simple().to_string()[..8].to_string();
    let upper = id.to_ascii_uppercase();
    let display = format!("{}-{}", &upper[..4], &upper[4..]);
    (id, display)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_device_layout_uses_native_types() {
        let script = sfdisk_script(false);
        assert!(script.starts_with("label: gpt\n"));
        assert!(script.contains(&format!("size=200MiB, type={}", ESP_TYPE)));
        assert!(script.contains(&format!("size=1GiB, type={}", LINUX_FS_TYPE)));
        assert!(!script.contains(LINUX_RAID_TYPE));
        assert_eq!(script.lines().count(), 5);
    }

    #[test]
    fn mirrored_layout_uses_raid_types() {
        let script = sfdisk_script(true);
        assert!(script.contains(&format!("size=200MiB, type={}", LINUX_RAID_TYPE)));
        assert!(script.contains(&format!("size=1GiB, type={}", LINUX_RAID_TYPE)));
        assert!(script.ends_with(&format!("type={}\n", LINUX_FS_TYPE)));
    }

    #[test]
    fn partition_naming() {
        assert_eq!(partition_path(Utf8Path::new("/dev/sdb"), 4), "/dev/sdb4");
        assert_eq!(partition_path(Utf8Path::new("/dev/nvme0n1"), 2), "/dev/nvme0n1p2");
        assert_eq!(partition_path(Utf8Path::new("/dev/mmcblk0"), 1), "/dev/mmcblk0p1");
    }

    #[test]
    fn detects_existing_partitions() {
        let listing = "Disk /dev/sdb: 20 GiB\n\
                       Device Start End\n\
                       /dev/sdb1 2048 4095 2048 1M BIOS boot\n";
        assert!(has_partitions(listing, Utf8Path::new("/dev/sdb")));
        assert!(!has_partitions("Disk /dev/sdb: 20 GiB\n", Utf8Path::new("/dev/sdb")));
    }

    #[test]
    fn role_names() {
        assert_eq!(FsRole::BootEfi.as_ref(), "boot-efi");
        assert_eq!(raid_device(FsRole::Boot), "/dev/md/new-boot");
        assert_eq!(raid_device(FsRole::BootEfi), "/dev/md/new-boot-efi");
        assert_eq!(mapping_name(1), "new-root-1");
    }

    #[test]
    fn vfat_id_format() {
        let uuid = uuid::Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
        assert_eq!(vfat_volume_id(&uuid), ("a1b2c3d4".to_string(), "A1B2-C3D4".to_string()));
    }
}
