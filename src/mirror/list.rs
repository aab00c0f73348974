use serde::{Deserialize, Serialize};

/// One origin server of the mirror network.
///
/// Identity is the base URL; two entries with the same base URL are the same
/// mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Base URL, always ending with `/`
    pub base_url: String,
    pub provider: String,
    pub location: String,
    pub note: String,
    pub continent: String,
}

impl Mirror {
    /// A mirror known only by its URL
    pub fn from_url(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            provider: String::new(),
            location: String::new(),
            note: String::new(),
            continent: String::new(),
        }
    }

    /// Full URL of `resource_id` on this mirror
    pub fn url_for(&self, resource_id: &str) -> String {
        format!("{}{}", self.base_url, resource_path(resource_id))
    }
}

fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// Relative path of a resource under a mirror's base URL.
///
/// Numeric ids use the mirror network's directory tree: every digit but the
/// last becomes a directory level, followed by a directory named after the
/// id itself (`1342` → `1/3/4/1342/1342-0.txt`). Single-digit ids live under
/// `0/`. Anything else is taken as a relative path already.
pub fn resource_path(resource_id: &str) -> String {
    let id = resource_id.trim_matches('/');
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return id.to_string();
    }

    let prefix: Vec<&str> = if id.len() == 1 {
        vec!["0"]
    } else {
        (0..id.len() - 1).map(|i| &id[i..=i]).collect()
    };
    format!("{}/{}/{}-0.txt", prefix.join("/"), id, id)
}

/// Parse a mirror list.
///
/// The list is a pipe-delimited table with the columns
/// `continent | nation | location | provider | url | note`. Header and
/// separator rows, non-HTTP(S) URLs and duplicate base URLs are skipped.
pub fn parse_mirror_list(text: &str) -> Vec<Mirror> {
    let mut mirrors: Vec<Mirror> = Vec::new();

    for line in text.lines() {
        if !line.contains('|') {
            continue;
        }
        let line = line.trim().trim_start_matches('|').trim_end_matches('|');
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 5 {
            continue;
        }

        let url = fields[4];
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            continue;
        }

        let location = match (fields[2], fields[1]) {
            ("", nation) => nation.to_string(),
            (location, "") => location.to_string(),
            (location, nation) => format!("{}, {}", location, nation),
        };

        let mirror = Mirror {
            base_url: normalize_base_url(url),
            provider: fields[3].to_string(),
            location,
            note: fields.get(5).copied().unwrap_or_default().to_string(),
            continent: fields[0].to_string(),
        };

        if mirrors.iter().all(|m| m.base_url != mirror.base_url) {
            mirrors.push(mirror);
        }
    }

    mirrors
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
| continent     | nation        | location     | provider            | url                                  | note |
|---------------|---------------|--------------|---------------------|--------------------------------------|------|
| North America | United States | Chapel Hill  | ibiblio             | http://www.gutenberg.lib.md.us/      | fast |
| Europe        | Germany       | Erlangen     | FAU                 | https://ftp.fau.de/gutenberg         |      |
| Europe        | Germany       | Erlangen     | FAU                 | ftp://ftp.fau.de/gutenberg/          |      |
| Europe        | Germany       | Erlangen     | FAU                 | https://ftp.fau.de/gutenberg/        | dup  |
";

    #[test]
    fn parses_table_rows_and_skips_noise() {
        let mirrors = parse_mirror_list(SAMPLE);
        assert_eq!(mirrors.len(), 2);

        assert_eq!(mirrors[0].base_url, "http://www.gutenberg.lib.md.us/");
        assert_eq!(mirrors[0].provider, "ibiblio");
        assert_eq!(mirrors[0].location, "Chapel Hill, United States");
        assert_eq!(mirrors[0].continent, "North America");
        assert_eq!(mirrors[0].note, "fast");

        assert_eq!(mirrors[1].base_url, "https://ftp.fau.de/gutenberg/");
    }

    #[test]
    fn empty_or_garbage_list_parses_to_nothing() {
        assert!(parse_mirror_list("").is_empty());
        assert!(parse_mirror_list("<html>not a list</html>").is_empty());
    }

    #[test]
    fn numeric_ids_use_directory_tree() {
        assert_eq!(resource_path("1342"), "1/3/4/1342/1342-0.txt");
        assert_eq!(resource_path("84"), "8/84/84-0.txt");
        assert_eq!(resource_path("5"), "0/5/5-0.txt");
        assert_eq!(resource_path("cache/epub/1342/pg1342.txt"), "cache/epub/1342/pg1342.txt");
    }

    #[test]
    fn url_for_joins_base_and_path() {
        let mirror = Mirror::from_url("https://example.org/mirror");
        assert_eq!(mirror.url_for("12"), "https://example.org/mirror/1/12/12-0.txt");
    }
}
