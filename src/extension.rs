//! Extension extraction for the Scan Worker Pool (§4.E). Operates
//! right-to-left from the last path component: find the last two `.`s
//! after the last `/`. If the right-hand segment matches a known
//! compound-tail rule, the compound form (both segments) is returned.

const TAR_COMPRESSION_SUFFIXES: &[&str] = &["gz", "bz2", "xz", "zst", "lz", "lz4", "z"];
const COMPOUND_MIDDLE_SEGMENTS: &[&str] = &["backup", "tmp", "part", "old"];

/// Extracts the (possibly compound) extension from `path`, always
/// lower-cased ASCII, always including the leading dot. Returns `""` if the
/// final path component has no dot.
pub fn extract_extension(path: &str) -> String {
    let file_name = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };

    let dots: Vec<usize> = file_name
        .char_indices()
        .filter(|(_, c)| *c == '.')
        .map(|(i, _)| i)
        .collect();

    let Some(&last_dot) = dots.last() else {
        return String::new();
    };

    let final_segment = &file_name[last_dot + 1..];
    let final_segment_lower = final_segment.to_ascii_lowercase();

    // Trailing `.!qb` is always compound, regardless of a preceding dot.
    if final_segment_lower == "!qb" {
        if dots.len() >= 2 {
            let prev_dot = dots[dots.len() - 2];
            return format!(
                ".{}.{}",
                &file_name[prev_dot + 1..last_dot].to_ascii_lowercase(),
                final_segment_lower
            );
        }
        return format!(".{final_segment_lower}");
    }

    let Some(&prev_dot) = dots.len().checked_sub(2).map(|i| &dots[i]) else {
        return format!(".{final_segment_lower}");
    };

    let middle_segment = &file_name[prev_dot + 1..last_dot];
    let middle_lower = middle_segment.to_ascii_lowercase();

    let is_compound = middle_lower == "original"
        || (middle_lower == "tar" && TAR_COMPRESSION_SUFFIXES.contains(&final_segment_lower.as_str()))
        || COMPOUND_MIDDLE_SEGMENTS.contains(&middle_lower.as_str());

    if is_compound {
        format!(".{middle_lower}.{final_segment_lower}")
    } else {
        format!(".{final_segment_lower}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_extension_is_lowercased() {
        assert_eq!(extract_extension("/media/Film.MP4"), ".mp4");
    }

    #[test]
    fn no_dot_is_empty() {
        assert_eq!(extract_extension("/media/noext"), "");
    }

    #[test]
    fn qbittorrent_incomplete_marker_is_compound() {
        assert_eq!(
            extract_extension("/media/movies/Film.mkv.!qb"),
            ".mkv.!qb"
        );
    }

    #[test]
    fn tar_gz_is_compound() {
        assert_eq!(extract_extension("/media/backups/db.tar.gz"), ".tar.gz");
        assert_eq!(extract_extension("archive.tar.zst"), ".tar.zst");
    }

    #[test]
    fn tar_with_unknown_suffix_is_not_compound() {
        // "tar" followed by a suffix not in the known compression list:
        // only the final segment counts.
        assert_eq!(extract_extension("archive.tar.exe"), ".exe");
    }

    #[test]
    fn calibre_original_backup_is_compound() {
        assert_eq!(
            extract_extension("/library/book.original_epub"),
            ".original_epub"
        );
    }

    #[test]
    fn calibre_original_dotted_is_compound() {
        assert_eq!(extract_extension("book.original.epub"), ".original.epub");
    }

    #[test]
    fn backup_tmp_part_old_segments_are_compound() {
        assert_eq!(extract_extension("movie.backup.mkv"), ".backup.mkv");
        assert_eq!(extract_extension("movie.tmp.mkv"), ".tmp.mkv");
        assert_eq!(extract_extension("movie.part.mkv"), ".part.mkv");
        assert_eq!(extract_extension("movie.old.mkv"), ".old.mkv");
    }

    #[test]
    fn single_dot_file_is_not_compound() {
        assert_eq!(extract_extension("movie.mkv"), ".mkv");
    }

    #[test]
    fn directories_before_last_slash_are_ignored() {
        assert_eq!(
            extract_extension("/a.b.c/movies/Film.mp4"),
            ".mp4"
        );
    }

    #[test]
    fn hidden_dotfile_with_single_dot_has_no_usable_prior_segment() {
        // ".gitignore" — the only dot is the leading one; final segment
        // is "gitignore", with nothing before it to test as a middle
        // segment, so it's treated as a plain, non-compound extension.
        assert_eq!(extract_extension(".gitignore"), ".gitignore");
    }
}
