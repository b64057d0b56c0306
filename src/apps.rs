use crate::screen::LaunchableApp;

/// A launchable app picked from a spoken query, plus what the user asked for inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMatch<'a> {
    pub app: &'a LaunchableApp,
    pub remainder: String,
}

/// Longest label that prefixes the query wins and leaves a remainder;
/// otherwise the longest label contained in (or containing) the query.
pub fn match_app<'a>(apps: &'a [LaunchableApp], query: &str) -> Option<AppMatch<'a>> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }

    let by_prefix = apps
        .iter()
        .filter_map(|app| {
            let rest = strip_label_prefix(query, app.label.trim())?;
            Some((app, rest))
        })
        .max_by_key(|(app, _)| app.label.trim().chars().count());
    if let Some((app, rest)) = by_prefix {
        return Some(AppMatch {
            app,
            remainder: clean_remainder(rest),
        });
    }

    let folded = query.to_lowercase();
    apps.iter()
        .filter(|app| {
            let label = app.label.trim().to_lowercase();
            !label.is_empty() && (folded.contains(&label) || label.contains(&folded))
        })
        .max_by_key(|app| app.label.trim().chars().count())
        .map(|app| AppMatch {
            app,
            remainder: String::new(),
        })
}

/// Case-insensitive `query.strip_prefix(label)` that only cuts at a word boundary.
fn strip_label_prefix<'q>(query: &'q str, label: &str) -> Option<&'q str> {
    if label.is_empty() {
        return None;
    }
    let mut query_chars = query.char_indices();
    for label_char in label.chars() {
        let (_, query_char) = query_chars.next()?;
        if !query_char.to_lowercase().eq(label_char.to_lowercase()) {
            return None;
        }
    }
    let rest = match query_chars.next() {
        None => "",
        Some((i, c)) if c.is_whitespace() || c == ',' => &query[i..],
        Some(_) => return None,
    };
    Some(rest)
}

fn clean_remainder(rest: &str) -> String {
    let rest = rest.trim_matches(|c: char| c.is_whitespace() || c == ',');
    for connective in ["and then ", "and ", "then ", "to "] {
        if rest.len() > connective.len()
            && rest.is_char_boundary(connective.len())
            && rest[..connective.len()].eq_ignore_ascii_case(connective)
        {
            return rest[connective.len()..].trim().to_string();
        }
    }
    rest.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apps() -> Vec<LaunchableApp> {
        ["Maps", "Google Maps", "Mail", "Phone", "Photos"]
            .iter()
            .map(|label| LaunchableApp {
                label: label.to_string(),
                id: label.to_lowercase().replace(' ', "."),
            })
            .collect()
    }

    #[test]
    fn longest_prefix_label_captures_remainder() {
        let apps = apps();
        let m = match_app(&apps, "google maps and find a pharmacy").unwrap();
        assert_eq!(m.app.label, "Google Maps");
        assert_eq!(m.remainder, "find a pharmacy");

        let m = match_app(&apps, "Maps").unwrap();
        assert_eq!(m.app.label, "Maps");
        assert_eq!(m.remainder, "");
    }

    #[test]
    fn prefix_must_end_on_word_boundary() {
        let apps = apps();
        let m = match_app(&apps, "mailbox").unwrap();
        // Falls through to containment: "mailbox" contains "mail".
        assert_eq!(m.app.label, "Mail");
        assert_eq!(m.remainder, "");
    }

    #[test]
    fn containment_fallback() {
        let apps = apps();
        let m = match_app(&apps, "my photos").unwrap();
        assert_eq!(m.app.label, "Photos");
        let m = match_app(&apps, "pho").unwrap();
        assert_eq!(m.app.label, "Photos");
    }

    #[test]
    fn no_match() {
        let apps = apps();
        assert!(match_app(&apps, "calculator").is_none());
        assert!(match_app(&apps, "  ").is_none());
    }
}
