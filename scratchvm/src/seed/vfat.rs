//! FAT12 volume labelled `cidata`, the NoCloud datasource format.

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use std::io::{Cursor, Write};

const SECTOR: usize = 512;

/// Upper bound for the combined size of the documents.
pub(crate) const MAX_SEED_BYTES: usize = 32 * 1024;

/// Pack `files` into a freshly formatted volume.
///
/// fatfs is built without `chrono`, so every directory entry carries the
/// same fixed timestamp; with a caller-provided `volume_id` the output is a
/// pure function of the inputs.
pub(crate) fn build_vfat(volume_id: u32, files: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
    let file_sectors: usize = files.iter().map(|(_, data)| data.len().div_ceil(SECTOR)).sum();
    // Smallest size fatfs accepts for FAT12 with 512-byte clusters, plus room
    // for the file data and the FAT entries that describe it.
    let sectors = 42.max(file_sectors + 35 + ((file_sectors + 1) / 341 * 2));

    let mut disk = Cursor::new(vec![0; sectors * SECTOR]);
    fatfs::format_volume(
        &mut disk,
        FormatVolumeOptions::new()
            .bytes_per_cluster(SECTOR as u32)
            .volume_id(volume_id)
            .volume_label(*b"cidata     "),
    )?;

    {
        let fs = FileSystem::new(&mut disk, FsOptions::new())?;
        let root_dir = fs.root_dir();
        for (name, data) in files {
            let mut file = root_dir.create_file(name)?;
            file.write_all(data)?;
        }
    }

    Ok(disk.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_build_vfat_handles_awkward_sizes() {
        // fatfs panics on impossible geometries, so sweep the size math.
        let upper = MAX_SEED_BYTES + 4096;
        for a in (0..upper).step_by(1019) {
            for b in (0..upper).step_by(2039) {
                let meta = vec![0x5a; a];
                let user = vec![0xa5; b];
                let net = vec![0x3c; 97];
                assert!(
                    build_vfat(
                        7,
                        &[("meta-data", &meta), ("user-data", &user), ("network-config", &net)]
                    )
                    .is_ok()
                );
            }
        }
    }

    #[test]
    fn test_volume_reads_back() {
        let image = build_vfat(42, &[("meta-data", b"instance-id: x\n"), ("user-data", b"#cloud-config\n")])
            .unwrap();

        let mut cursor = Cursor::new(image);
        let fs = FileSystem::new(&mut cursor, FsOptions::new()).unwrap();
        assert_eq!(fs.volume_id(), 42);
        assert_eq!(fs.volume_label().trim_end(), "cidata");

        let mut text = String::new();
        fs.root_dir()
            .open_file("user-data")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "#cloud-config\n");
    }
}
