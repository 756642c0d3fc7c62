//! Deterministic project-path → environment name mapping.
//!
//! The name doubles as the guest login name, so it must satisfy Linux
//! username rules, and it must be a pure function of the absolute project
//! path so that every invocation on any machine sharing the hash lands on
//! the same environment.
//!
//! Format: `<sanitized-basename>-<hash>`, where the hash is the first two
//! bytes of SHA-1 over the full absolute path as four lowercase hex chars.
//! Example: `/Users/alice/my-project` → `my-project-a1b2`.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use sha1::{Digest, Sha1};

/// Sanitized basenames are capped so the full name (basename + `-` + 4 hex
/// chars) stays within the 32-char login name limit.
const MAX_BASE_LEN: usize = 27;

static ENVIRONMENT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*-[0-9a-f]{4}$").expect("static pattern"));

/// Generate a valid environment name from a project path.
///
/// The path is resolved to absolute form first; relative inputs are
/// interpreted against the current directory. Fails when the path has no
/// usable basename (`/`, empty).
pub fn generate(project_path: &Path) -> Result<String> {
    let abs = std::path::absolute(project_path)
        .with_context(|| format!("failed to resolve absolute path: {}", project_path.display()))?;

    let basename = match abs.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => bail!("invalid project path: {}", project_path.display()),
    };
    if basename.is_empty() || basename == "." || basename == "/" {
        bail!("invalid project path: {}", project_path.display());
    }

    let sanitized = sanitize_basename(&basename);
    let hash = path_hash(&abs);
    let name = format!("{sanitized}-{hash}");

    if !is_valid_name(&name) {
        bail!("generated name '{name}' is not a valid login name");
    }

    Ok(name)
}

/// Reduce a basename to a valid login name component.
///
/// Lowercase; ASCII `[a-z0-9_-]` kept; every other code point (including
/// non-ASCII letters and digits) becomes `-`; underscores normalize to `-`;
/// hyphen runs collapse; leading/trailing hyphens are trimmed. An empty
/// result becomes `env`, a result not starting with a letter gets an `env-`
/// prefix, and the whole thing is truncated to leave room for the suffix.
fn sanitize_basename(basename: &str) -> String {
    let mut s = String::with_capacity(basename.len());
    for ch in basename.to_lowercase().chars() {
        match ch {
            'a'..='z' | '0'..='9' | '-' | '_' => s.push(ch),
            _ => s.push('-'),
        }
    }

    let s = s.replace('_', "-");

    // Collapse hyphen runs and trim the ends.
    let mut collapsed = String::with_capacity(s.len());
    let mut prev_hyphen = false;
    for ch in s.chars() {
        if ch == '-' {
            if !prev_hyphen {
                collapsed.push('-');
            }
            prev_hyphen = true;
        } else {
            collapsed.push(ch);
            prev_hyphen = false;
        }
    }
    let mut s = collapsed.trim_matches('-').to_string();

    if !s.is_empty() && !s.starts_with(|c: char| c.is_ascii_lowercase()) {
        s = format!("env-{s}");
    }
    if s.is_empty() {
        s = "env".to_string();
    }

    if s.len() > MAX_BASE_LEN {
        s.truncate(MAX_BASE_LEN);
        s = s.trim_end_matches('-').to_string();
    }

    s
}

/// Four lowercase hex characters from the first two bytes of SHA-1 over the
/// absolute path.
fn path_hash(path: &Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    format!("{:02x}{:02x}", digest[0], digest[1])
}

/// Whether a name meets Linux login name requirements: 1–32 chars, first
/// char in `[a-z_]`, all chars in `[a-z0-9_-]`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 32 {
        return false;
    }
    let Some(first) = name.chars().next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first == '_') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Whether a name looks like one this tool generated: `<base>-<4 hex>`.
/// Used to filter system users and stray directories out of listings.
pub fn is_environment_name(name: &str) -> bool {
    ENVIRONMENT_NAME_RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn prefix_of(name: &str) -> &str {
        // Everything before the trailing "-XXXX" hash.
        &name[..name.len() - 5]
    }

    fn hash_of(name: &str) -> &str {
        &name[name.len() - 4..]
    }

    // -----------------------------------------------------------------------
    // generate
    // -----------------------------------------------------------------------

    #[test]
    fn generate_simple_path() {
        let name = generate(Path::new("/Users/alice/my-project")).unwrap();
        assert_eq!(prefix_of(&name), "my-project");

        // The suffix is the leading two bytes of SHA-1 over the full path.
        let mut hasher = Sha1::new();
        hasher.update(b"/Users/alice/my-project");
        let digest = hasher.finalize();
        let expected = format!("my-project-{:02x}{:02x}", digest[0], digest[1]);
        assert_eq!(name, expected);
    }

    #[test]
    fn generate_path_with_spaces() {
        let name = generate(Path::new("/Users/alice/My Cool App")).unwrap();
        assert_eq!(prefix_of(&name), "my-cool-app");
    }

    #[test]
    fn generate_path_with_special_chars() {
        let name = generate(Path::new("/Users/alice/project@2024!")).unwrap();
        assert_eq!(prefix_of(&name), "project-2024");
    }

    #[test]
    fn generate_path_starting_with_number() {
        let name = generate(Path::new("/Users/alice/123-project")).unwrap();
        assert_eq!(prefix_of(&name), "env-123-project");
    }

    #[test]
    fn generate_path_with_unicode() {
        let name = generate(Path::new("/Users/alice/project-α-β")).unwrap();
        assert!(prefix_of(&name).starts_with("project"));
        assert!(name.is_ascii());
    }

    #[test]
    fn generate_very_long_basename() {
        let path = PathBuf::from(format!("/Users/alice/{}", "a".repeat(100)));
        let name = generate(&path).unwrap();
        assert_eq!(prefix_of(&name), "a".repeat(27));
        assert!(name.len() <= 32);
    }

    #[test]
    fn generate_root_is_invalid() {
        assert!(generate(Path::new("/")).is_err());
    }

    #[test]
    fn generate_is_deterministic() {
        let path = Path::new("/Users/alice/my-project");
        let first = generate(path).unwrap();
        let second = generate(path).unwrap();
        let third = generate(path).unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn generate_same_basename_different_parents() {
        let a = generate(Path::new("/Users/alice/my-project")).unwrap();
        let b = generate(Path::new("/Users/bob/my-project")).unwrap();
        let c = generate(Path::new("/Users/alice/projects/my-project")).unwrap();

        assert_eq!(prefix_of(&a), prefix_of(&b));
        assert_eq!(prefix_of(&b), prefix_of(&c));

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn generate_always_valid_and_bounded() {
        let paths = [
            "/Users/alice/Documents/my-ai-agent",
            "/Users/bob/Projects/Web App 2024",
            "/home/charlie/dev/project_name",
            "/Users/dave/Desktop/NEW PROJECT!!!",
            "/srv/@@@",
            "/data/проект",
        ];
        for p in paths {
            let name = generate(Path::new(p)).unwrap();
            assert!(is_valid_name(&name), "{name} should be valid (from {p})");
            assert!(name.len() <= 32, "{name} exceeds 32 chars");
            assert_eq!(hash_of(&name).len(), 4);
        }
    }

    #[test]
    fn generate_matches_environment_pattern() {
        let name = generate(Path::new("/home/alice/some-project")).unwrap();
        assert!(is_environment_name(&name));
    }

    // -----------------------------------------------------------------------
    // sanitize_basename
    // -----------------------------------------------------------------------

    #[test]
    fn sanitize_table() {
        let cases = [
            ("my-project", "my-project"),
            ("MyProject", "myproject"),
            ("My Project", "my-project"),
            ("project@2024!", "project-2024"),
            ("my_project_name", "my-project-name"),
            ("my---project", "my-project"),
            ("-my-project", "my-project"),
            ("my-project-", "my-project"),
            ("123project", "env-123project"),
            ("123456", "env-123456"),
            ("project-α-β-γ", "project"),
            ("café-project", "caf-project"),
            ("@@@", "env"),
        ];
        for (input, want) in cases {
            assert_eq!(sanitize_basename(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn sanitize_truncates_long_names() {
        assert_eq!(sanitize_basename(&"a".repeat(50)), "a".repeat(27));
    }

    #[test]
    fn sanitize_truncation_trims_trailing_hyphen() {
        // 26 chars then a hyphen then more text: the cut lands on the hyphen.
        let input = format!("{}-tail", "a".repeat(26));
        assert_eq!(sanitize_basename(&input), "a".repeat(26));
    }

    // -----------------------------------------------------------------------
    // path_hash
    // -----------------------------------------------------------------------

    #[test]
    fn path_hash_is_four_lowercase_hex() {
        for p in ["/Users/alice/project", "/home/alice/проект", "/x"] {
            let hash = path_hash(Path::new(p));
            assert_eq!(hash.len(), 4);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn path_hash_distinguishes_paths() {
        let mut seen = std::collections::HashMap::new();
        for p in [
            "/Users/alice/project",
            "/Users/bob/project",
            "/Users/alice/other-project",
            "/home/alice/project",
        ] {
            let hash = path_hash(Path::new(p));
            if let Some(other) = seen.insert(hash.clone(), p) {
                panic!("hash collision between {p} and {other}: {hash}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // is_valid_name / is_environment_name
    // -----------------------------------------------------------------------

    #[test]
    fn valid_name_table() {
        let max_len = "a".repeat(32);
        let too_long = "a".repeat(33);
        let cases = [
            ("my-project", true),
            ("my_project", true),
            ("project123", true),
            ("_project", true),
            (max_len.as_str(), true),
            ("", false),
            (too_long.as_str(), false),
            ("-project", false),
            ("1project", false),
            ("project@123", false),
            ("my project", false),
            ("my.project", false),
            ("MyProject", false),
        ];
        for (input, want) in cases {
            assert_eq!(is_valid_name(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn environment_name_table() {
        let cases = [
            ("my-project-a1b2", true),
            ("env-123-abcd", true),
            ("a-0000", true),
            ("my-project", false),     // no hash suffix
            ("my-project-xyz9", false), // non-hex suffix
            ("my-project-a1b", false),  // short suffix
            ("My-Project-a1b2", false), // uppercase
            ("lima", false),            // system user
            ("_svc-a1b2", false),       // underscore start
        ];
        for (input, want) in cases {
            assert_eq!(is_environment_name(input), want, "input: {input:?}");
        }
    }
}
