// Lines-of-code counting: non-blank lines that are not only comments.
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

struct CommentSyntax {
    line: &'static [&'static str],
    block: Option<(&'static str, &'static str)>,
}

const C_LIKE: CommentSyntax = CommentSyntax {
    line: &["//"],
    block: Some(("/*", "*/")),
};

const HASH: CommentSyntax = CommentSyntax {
    line: &["#"],
    block: None,
};

const NONE: CommentSyntax = CommentSyntax {
    line: &[],
    block: None,
};

fn comment_syntax(path: &Path) -> CommentSyntax {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "cs" | "go" | "java" | "js" | "jsx" | "kt" | "rs" | "scala"
        | "swift" | "ts" | "tsx" | "php" => C_LIKE,
        "py" | "r" | "rb" | "sh" | "pl" | "yaml" | "yml" | "toml" => HASH,
        "sql" | "hs" | "lua" => CommentSyntax {
            line: &["--"],
            block: None,
        },
        "scm" | "el" | "lisp" | "clj" => CommentSyntax {
            line: &[";"],
            block: None,
        },
        _ => NONE,
    }
}

pub fn count_lines_of_code(path: &Path) -> Result<i64> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    Ok(count_text(&text, &comment_syntax(path)))
}

fn count_text(text: &str, syntax: &CommentSyntax) -> i64 {
    let mut count = 0;
    let mut in_block = false;

    for line in text.lines() {
        let mut rest = line.trim();
        let mut has_code = false;

        while !rest.is_empty() {
            if in_block {
                let Some((_, close)) = syntax.block else { break };
                match rest.find(close) {
                    Some(index) => {
                        rest = rest[index + close.len()..].trim_start();
                        in_block = false;
                    }
                    None => rest = "",
                }
                continue;
            }

            if syntax.line.iter().any(|prefix| rest.starts_with(prefix)) {
                break;
            }

            if let Some((open, _)) = syntax.block {
                if let Some(stripped) = rest.strip_prefix(open) {
                    rest = stripped;
                    in_block = true;
                    continue;
                }
            }

            has_code = true;
            break;
        }

        if has_code {
            count += 1;
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_python() {
        let text = "# header\n\nimport os\n\n    # indented comment\nx = 1  # trailing\nprint(x)\n";
        assert_eq!(count_text(text, &HASH), 3);
    }

    #[test]
    fn test_c_like() {
        let text = "/* block\n   still block */\nint x; // trailing\n/* a */ int y;\n// line\n\nreturn 0;\n";
        assert_eq!(count_text(text, &C_LIKE), 3);
    }

    #[test]
    fn test_unknown_extension_counts_non_blank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "one\n\n# two\nthree\n").unwrap();
        assert_eq!(count_lines_of_code(&path).unwrap(), 3);

        let path = dir.path().join("submission.py");
        fs::write(&path, "def f():\n    return 1\n\n# done\nf()\nprint(f())\n").unwrap();
        assert_eq!(count_lines_of_code(&path).unwrap(), 4);
    }
}
