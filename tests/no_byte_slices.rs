use anyhow::Context;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

// Fails if source files slice strings with literal byte ranges like
// `text[..50]` or `to_string()[..8]`, which panic when the boundary falls
// inside a multi-byte character. Only numeric literal bounds are flagged, so
// `&buf[..n]` and `&line[start..]` pass.

fn literal_range_patterns() -> Vec<Regex> {
    [
        // `[..50]`, `[0..50]`, `[..=49]`
        r"\[\s*\d*\s*\.\.=?\s*\d+\s*\]",
        // `[3..]`
        r"\[\s*\d+\s*\.\.\s*\]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("pattern compiles"))
    .collect()
}

fn find_literal_slices(text: &str, patterns: &[Regex]) -> Vec<usize> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| patterns.iter().any(|re| re.is_match(line)))
        .map(|(i, _)| i + 1)
        .collect()
}

fn visit_rs_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir failed: {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            visit_rs_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
    Ok(())
}

#[test]
fn test_detector_flags_literal_ranges() {
    let patterns = literal_range_patterns();
    let flagged = [
        "let head = &title[..50];",
        "let tail = &s[2..];",
        "let short = id.to_string()[..8].to_string();",
        "let mid = &name[1..4];",
        "let inclusive = &name[..=4];",
    ];
    for line in flagged {
        assert_eq!(find_literal_slices(line, &patterns), vec![1], "should flag: {line}");
    }

    let allowed = [
        "let chunk = &buf[..n];",
        "let rest = &line[start..];",
        "let all = &bytes[..];",
        "let item = items[0];",
        "let window = &data[offset..offset + len];",
    ];
    for line in allowed {
        assert!(find_literal_slices(line, &patterns).is_empty(), "should allow: {line}");
    }
}

#[test]
fn no_literal_byte_index_string_slices() -> anyhow::Result<()> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let patterns = literal_range_patterns();
    let mut failures: Vec<String> = Vec::new();

    let mut files: Vec<PathBuf> = Vec::new();
    visit_rs_files(&repo_root.join("src"), &mut files)?;
    assert!(!files.is_empty(), "no sources found under src/");

    for path in files {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let lines: Vec<&str> = text.lines().collect();
        for n in find_literal_slices(&text, &patterns) {
            failures.push(format!("{}:{}: {}", path.display(), n, lines[n - 1].trim()));
        }
    }

    if !failures.is_empty() {
        anyhow::bail!(
            "Found literal-range slices in source files:\n{}",
            failures.join("\n")
        );
    }

    Ok(())
}
