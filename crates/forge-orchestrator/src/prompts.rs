use serde_json::{Map, Value};

use forge_types::Task;

use crate::render_file_block;

pub const PLANNING_SYSTEM_PROMPT: &str = r#"You plan software projects for a code generator.
Break the request into small tasks that can each be generated in one pass.

Reply with a single JSON object and nothing else:
{
  "project": {
    "name": "kebab-case-name",
    "description": "one sentence",
    "framework": "nextjs | react | vite | nestjs | fastapi",
    "language": "typescript | javascript | python"
  },
  "tasks": [
    {
      "id": "task-1",
      "title": "short title",
      "description": "what this task builds",
      "type": "component | api | schema | config | test",
      "files": ["relative/path/to/file.ts"],
      "dependencies": []
    }
  ]
}

Rules:
- List tasks in the order they must be generated.
- A task may only depend on ids of tasks listed before it.
- File paths are relative to the project root.
- Start with configuration and schema, finish with tests."#;

/// System prompt for per-task code generation. The format example is rendered
/// with the same helper the extractor is tested against.
pub fn generation_system_prompt() -> String {
    let example = render_file_block("path/to/file.tsx", "// file contents", Some("tsx"));
    format!(
        "You write production-quality code for one task of a larger project.\n\n\
         Emit every file as a fenced block whose opening fence names its path:\n\n\
         {example}\n\
         Rules:\n\
         - Write complete files, never fragments or placeholders.\n\
         - Use the paths you are given, relative to the project root.\n\
         - Prefer typed code, handle errors, and keep imports consistent across files.\n\
         - Keep explanations outside the code blocks short."
    )
}

/// User message for the planning call: the request followed by any context
/// the caller supplied.
pub fn build_planning_prompt(user_prompt: &str, context: &Map<String, Value>) -> String {
    let mut prompt = user_prompt.trim().to_string();
    let mut lines = Vec::new();

    if let Some(framework) = context.get("framework").and_then(render_scalar) {
        lines.push(format!("Framework: {framework}"));
    }
    if let Some(language) = context.get("language").and_then(render_scalar) {
        lines.push(format!("Language: {language}"));
    }
    if let Some(features) = context.get("features").and_then(render_list) {
        lines.push(format!("Features: {features}"));
    }

    let rest: Map<String, Value> = context
        .iter()
        .filter(|(key, value)| !is_reserved_context_key(key) && !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !rest.is_empty() {
        let rendered =
            serde_json::to_string_pretty(&Value::Object(rest)).unwrap_or_else(|_| "{}".into());
        lines.push(format!("Additional context:\n{rendered}"));
    }

    if !lines.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&lines.join("\n"));
    }
    prompt
}

pub fn build_task_prompt(task: &Task) -> String {
    let files = if task.files.is_empty() {
        "choose suitable paths".to_string()
    } else {
        task.files.join(", ")
    };
    format!(
        "Task: {}\nDescription: {}\nFiles to create: {}\n\nGenerate complete code for these files.",
        task.title, task.description, files
    )
}

fn is_reserved_context_key(key: &str) -> bool {
    matches!(
        key,
        "framework" | "language" | "features" | "project_id" | "projectId"
    )
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render_list(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().filter_map(render_scalar).collect();
            (!items.is_empty()).then(|| items.join(", "))
        }
        other => render_scalar(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_types::TaskKind;
    use serde_json::json;

    fn context(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn planning_prompt_without_context_is_the_request() {
        assert_eq!(
            build_planning_prompt("  Build a todo app  ", &Map::new()),
            "Build a todo app"
        );
    }

    #[test]
    fn planning_prompt_renders_known_keys_then_remaining_json() {
        let prompt = build_planning_prompt(
            "Build a todo app",
            &context(json!({
                "framework": "nextjs",
                "language": "typescript",
                "features": ["auth", "dark mode"],
                "project_id": "p-1",
                "database": "sqlite"
            })),
        );
        assert!(prompt.starts_with(
            "Build a todo app\n\nFramework: nextjs\nLanguage: typescript\nFeatures: auth, dark mode\n"
        ));
        assert!(prompt.contains("Additional context:\n{\n  \"database\": \"sqlite\"\n}"));
        assert!(!prompt.contains("p-1"));
    }

    #[test]
    fn task_prompt_lists_target_files() {
        let task = Task::new("t1", "Todo API", TaskKind::Api)
            .with_description("CRUD endpoints for todos")
            .with_files(["src/api/todos.ts", "src/api/index.ts"]);
        assert_eq!(
            build_task_prompt(&task),
            "Task: Todo API\nDescription: CRUD endpoints for todos\nFiles to create: src/api/todos.ts, src/api/index.ts\n\nGenerate complete code for these files."
        );
    }

    #[test]
    fn generation_prompt_shows_the_block_format() {
        assert!(generation_system_prompt().contains("```tsx file=\"path/to/file.tsx\""));
    }
}
