use std::path::PathBuf;

use crate::ids::Fingerprint;

/// Number of directory levels between the storage root and the leaf file.
pub const PATH_SEGMENTS: usize = 8;
/// Hex characters per directory level; 8 * 5 == the full 40-char hex.
pub const PATH_SEGMENT_LEN: usize = 5;

/// Derive the nested on-disk location for a fingerprint.
///
/// The 40-char hex string is split into 8 directories of 5 chars each,
/// bounding per-directory fan-out and hiding the original filename; the
/// leaf file is named with the full fingerprint.
pub fn content_path(fp: &Fingerprint) -> PathBuf {
    let hex = fp.to_hex();
    let mut path = PathBuf::new();
    for segment in 0..PATH_SEGMENTS {
        let start = segment * PATH_SEGMENT_LEN;
        path.push(&hex[start..start + PATH_SEGMENT_LEN]);
    }
    path.push(hex);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_path_nests_eight_segments() {
        let fp = Fingerprint::of("momsbestpicture");
        let path = content_path(&fp);
        let parts: Vec<_> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        assert_eq!(parts.len(), PATH_SEGMENTS + 1);
        assert_eq!(
            &parts[..PATH_SEGMENTS],
            &["68044", "29f74", "181a6", "3c50c", "3d81d", "733a1", "2f14a", "353ff"]
        );
        assert_eq!(parts[PATH_SEGMENTS], fp.to_hex());
    }

    #[test]
    fn content_path_is_deterministic() {
        let fp = Fingerprint::of("note.txt");
        assert_eq!(content_path(&fp), content_path(&fp));
        let segments: String = fp.to_hex();
        for part in content_path(&fp).components().take(PATH_SEGMENTS) {
            let part = part.as_os_str().to_string_lossy();
            assert_eq!(part.len(), PATH_SEGMENT_LEN);
            assert!(segments.contains(&*part));
        }
    }
}
