//! Pulls file blocks out of free-form model output.
//!
//! A file block is a fenced code block whose opening line names its target:
//!
//! ````text
//! ```tsx file="src/App.tsx"
//! export default function App() {}
//! ```
//! ````
//!
//! Blocks are returned in order of first appearance. A repeated path replaces
//! the earlier content but keeps its position.

use forge_types::GeneratedFile;

const FENCE: &str = "```";
const FILE_ATTR: &str = "file=\"";

pub fn extract_files(text: &str) -> Vec<GeneratedFile> {
    let mut files: Vec<GeneratedFile> = Vec::new();
    // (path, byte offset where the body starts)
    let mut open: Option<(&str, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let bare = line.trim_end_matches(['\n', '\r']);

        if let Some(path) = opening_fence_path(bare) {
            if let Some((abandoned, _)) = open {
                tracing::debug!(path = abandoned, "skipping unterminated file block");
            }
            open = Some((path, offset));
            continue;
        }

        if bare.trim() == FENCE {
            if let Some((path, body_start)) = open.take() {
                upsert(&mut files, path, &text[body_start..line_start]);
            }
        }
    }

    if let Some((path, _)) = open {
        tracing::debug!(path, "skipping unterminated file block");
    }
    files
}

/// Formats one file block the way [`extract_files`] reads it.
pub fn render_file_block(path: &str, content: &str, language: Option<&str>) -> String {
    let tag = language.map(|lang| format!("{lang} ")).unwrap_or_default();
    format!("{FENCE}{tag}file=\"{path}\"\n{content}\n{FENCE}\n")
}

fn opening_fence_path(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix(FENCE)?;
    if rest.starts_with('`') {
        return None;
    }
    let attr_at = rest.find(FILE_ATTR)?;
    let (tag, attr) = rest.split_at(attr_at);
    // at most a single language tag may precede the attribute
    if tag.trim().contains(char::is_whitespace) {
        return None;
    }
    let value = &attr[FILE_ATTR.len()..];
    let end = value.find('"')?;
    Some(&value[..end])
}

fn upsert(files: &mut Vec<GeneratedFile>, path: &str, body: &str) {
    let Some(file) = GeneratedFile::new(path, body.trim()) else {
        tracing::debug!(path, "skipping file block with unsafe path");
        return;
    };
    match files.iter_mut().find(|existing| existing.path == file.path) {
        Some(existing) => existing.content = file.content,
        None => files.push(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(files: &[GeneratedFile]) -> Vec<(&str, &str)> {
        files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_str()))
            .collect()
    }

    #[test]
    fn extracts_blocks_in_order_of_appearance() {
        let text = "Here you go.\n\n```tsx file=\"src/App.tsx\"\nexport default function App() {}\n```\n\nAnd the styles:\n```css file=\"src/app.css\"\nbody { margin: 0; }\n```\n";
        assert_eq!(
            pairs(&extract_files(text)),
            vec![
                ("src/App.tsx", "export default function App() {}"),
                ("src/app.css", "body { margin: 0; }"),
            ]
        );
    }

    #[test]
    fn rendered_block_round_trips_to_trimmed_content() {
        let content = "\n\n  fn main() {\n\n    println!(\"hi\");\n  }\n\n";
        let text = render_file_block("src/main.rs", content, Some("rust"));
        assert_eq!(
            pairs(&extract_files(&text)),
            vec![("src/main.rs", content.trim())]
        );

        let untagged = render_file_block("README.md", "# Todo", None);
        assert_eq!(pairs(&extract_files(&untagged)), vec![("README.md", "# Todo")]);
    }

    #[test]
    fn duplicate_paths_keep_the_last_content() {
        let text = format!(
            "{}{}{}",
            render_file_block("a.ts", "x", Some("ts")),
            render_file_block("b.ts", "b", Some("ts")),
            render_file_block("a.ts", "y", Some("ts")),
        );
        assert_eq!(pairs(&extract_files(&text)), vec![("a.ts", "y"), ("b.ts", "b")]);
    }

    #[test]
    fn unterminated_fence_yields_nothing() {
        let text = "```tsx file=\"a.tsx\"\nconst x = 1;";
        assert!(extract_files(text).is_empty());
    }

    #[test]
    fn unterminated_block_does_not_swallow_the_next_one() {
        let text = "```ts file=\"a.ts\"\nconst a = 1;\n```ts file=\"b.ts\"\nconst b = 2;\n```\n";
        assert_eq!(pairs(&extract_files(text)), vec![("b.ts", "const b = 2;")]);
    }

    #[test]
    fn empty_body_yields_empty_file() {
        let text = "```ts file=\"src/empty.ts\"\n```\n";
        assert_eq!(pairs(&extract_files(text)), vec![("src/empty.ts", "")]);
    }

    #[test]
    fn unsafe_paths_are_skipped() {
        let text = format!(
            "{}{}{}{}",
            render_file_block("../etc/passwd", "root", None),
            render_file_block("/abs/path.ts", "x", None),
            render_file_block("", "x", None),
            render_file_block("ok/file.ts", "fine", None),
        );
        assert_eq!(pairs(&extract_files(&text)), vec![("ok/file.ts", "fine")]);
    }

    #[test]
    fn plain_code_fences_are_ignored() {
        let text = "Install with:\n```bash\nnpm install\n```\n```json file=\"package.json\"\n{\"name\": \"todo\"}\n```\n";
        assert_eq!(
            pairs(&extract_files(text)),
            vec![("package.json", "{\"name\": \"todo\"}")]
        );
    }

    #[test]
    fn internal_whitespace_and_crlf_bodies_are_preserved() {
        let text = "```py file=\"app.py\"\r\ndef f():\r\n\r\n    return 1\r\n```\r\n";
        assert_eq!(
            pairs(&extract_files(text)),
            vec![("app.py", "def f():\r\n\r\n    return 1")]
        );
    }

    #[test]
    fn text_without_blocks_yields_nothing() {
        assert!(extract_files("").is_empty());
        assert!(extract_files("no code here, sorry").is_empty());
    }
}
