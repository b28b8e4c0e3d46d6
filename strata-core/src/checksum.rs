use crc32fast::Hasher;

/// Calculate a CRC32 checksum of the given content, line by line.
///
/// Each line is fed to the hasher followed by a single `\n`, so a file
/// re-saved with CRLF endings or a leading byte-order mark keeps its
/// checksum while joining or splitting lines changes it. The result is
/// eight lowercase hex digits for the `checksum` column.
pub fn calculate_checksum(content: &str) -> String {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut hasher = Hasher::new();
    for line in content.lines() {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:08x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_format() {
        let checksum = calculate_checksum("SELECT 1;");
        assert_eq!(checksum.len(), 8);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_checksum_deterministic() {
        let content = "CREATE TABLE users (id uuid PRIMARY KEY);\n";
        assert_eq!(calculate_checksum(content), calculate_checksum(content));
    }

    #[test]
    fn test_checksum_line_ending_normalization() {
        let unix = "line1\nline2\nline3";
        let windows = "line1\r\nline2\r\nline3";
        assert_eq!(calculate_checksum(unix), calculate_checksum(windows));
    }

    #[test]
    fn test_checksum_ignores_byte_order_mark() {
        let plain = "CREATE EXTENSION IF NOT EXISTS pgcrypto;\n";
        let with_bom = "\u{feff}CREATE EXTENSION IF NOT EXISTS pgcrypto;\n";
        assert_eq!(calculate_checksum(plain), calculate_checksum(with_bom));
    }

    #[test]
    fn test_checksum_detects_joined_lines() {
        let original = "-- disable legacy index\nDROP TABLE legacy;\n";
        let joined = "-- disable legacy indexDROP TABLE legacy;\n";
        assert_ne!(calculate_checksum(original), calculate_checksum(joined));
    }

    #[test]
    fn test_checksum_different_content() {
        assert_ne!(calculate_checksum("SELECT 1;"), calculate_checksum("SELECT 2;"));
    }

    #[test]
    fn test_checksum_empty() {
        assert_eq!(calculate_checksum(""), "00000000");
    }

    #[test]
    fn test_checksum_multiline_feeds_lines_separately() {
        let content = "CREATE TABLE t (\n  id INT\n);\n";

        let mut expected = Hasher::new();
        expected.update(b"CREATE TABLE t (\n");
        expected.update(b"  id INT\n");
        expected.update(b");\n");

        assert_eq!(calculate_checksum(content), format!("{:08x}", expected.finalize()));
    }
}
