/// Template handling for node inputs
///
/// Inputs are minijinja templates over context keys. The first two path segments of a
/// reference name the context key (`fetch.output`), the rest select into its value.
/// An input that is exactly one plain reference resolves to the typed JSON value it
/// points at; anything else is rendered to a string.

use crate::context::Payload;
use base64::Engine;
use minijinja::Environment;
use serde_json::{Map, Value};

/// One `{{ node.key.path }}` reference inside a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    /// Context key the reference reads (`fetch.output`)
    pub context_key: String,
    /// Dotted path below the context key, empty for the whole value
    pub selector: String,
}

impl TemplateRef {
    /// The reference as written (`fetch.output.user.name`)
    pub fn path(&self) -> String {
        if self.selector.is_empty() {
            self.context_key.clone()
        } else {
            format!("{}.{}", self.context_key, self.selector)
        }
    }
}

/// A compiled node input
#[derive(Debug, Clone, PartialEq)]
pub enum InputTemplate {
    /// No template syntax; used as-is
    Literal(Value),
    /// The whole input is one plain reference
    Reference { raw: String, reference: TemplateRef },
    /// Rendered with minijinja against the referenced values
    Render { raw: String, references: Vec<TemplateRef> },
}

impl InputTemplate {
    pub fn parse(value: &Value) -> Self {
        let Value::String(text) = value else {
            return InputTemplate::Literal(value.clone());
        };
        if !text.contains("{{") && !text.contains("{%") {
            return InputTemplate::Literal(value.clone());
        }

        let references = extract_references(text);
        if let Some(reference) = single_reference(text) {
            return InputTemplate::Reference {
                raw: text.clone(),
                reference,
            };
        }
        InputTemplate::Render {
            raw: text.clone(),
            references,
        }
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            InputTemplate::Literal(_) => None,
            InputTemplate::Reference { raw, .. } | InputTemplate::Render { raw, .. } => Some(raw),
        }
    }

    pub fn references(&self) -> Vec<&TemplateRef> {
        match self {
            InputTemplate::Literal(_) => Vec::new(),
            InputTemplate::Reference { reference, .. } => vec![reference],
            InputTemplate::Render { references, .. } => references.iter().collect(),
        }
    }
}

/// Every context reference inside `{{ … }}` and `{% … %}` blocks, deduplicated in order
/// of appearance
///
/// Names bound by the template itself (`{% for x in … %}`, `{% set y = … %}`, `loop`)
/// are not context references.
pub fn extract_references(text: &str) -> Vec<TemplateRef> {
    let blocks = template_blocks(text);
    let mut locals: Vec<&str> = vec!["loop"];
    for (statement, body) in &blocks {
        if *statement {
            locals.extend(bound_names(body));
        }
    }

    let mut found: Vec<TemplateRef> = Vec::new();
    for (_, body) in &blocks {
        for token in path_tokens(body) {
            let Some(reference) = parse_path(token) else { continue };
            let root = token.split('.').next().unwrap_or("");
            if locals.contains(&root) || found.contains(&reference) {
                continue;
            }
            found.push(reference);
        }
    }
    found
}

/// `(is_statement, body)` of every `{{ … }}` / `{% … %}` block
fn template_blocks(text: &str) -> Vec<(bool, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    loop {
        let next = [("{{", "}}", false), ("{%", "%}", true)]
            .into_iter()
            .filter_map(|(open, close, statement)| rest.find(open).map(|at| (at, close, statement)))
            .min_by_key(|(at, _, _)| *at);
        let Some((at, close, statement)) = next else { break };
        let after = &rest[at + 2..];
        let Some(end) = after.find(close) else { break };
        blocks.push((statement, &after[..end]));
        rest = &after[end + 2..];
    }
    blocks
}

/// Dotted identifier runs outside string literals
fn path_tokens(body: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut quote: Option<char> = None;
    let mut start: Option<usize> = None;
    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        let in_path = c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-';
        match (in_path, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                tokens.push(&body[s..i]);
                start = None;
            }
            _ => {}
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
    }
    if let Some(s) = start {
        tokens.push(&body[s..]);
    }
    tokens
}

/// Names a `for` or `set` statement binds
fn bound_names(statement: &str) -> Vec<&str> {
    let mut words = statement.split_whitespace();
    match words.next() {
        Some("for") => words
            .take_while(|word| *word != "in")
            .flat_map(|word| word.split(','))
            .map(|name| name.trim_matches(|c| c == '(' || c == ')'))
            .filter(|name| !name.is_empty())
            .collect(),
        Some("set") => words
            .next()
            .map(|name| name.split('=').next().unwrap_or(name))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn single_reference(text: &str) -> Option<TemplateRef> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains('|') {
        return None;
    }
    parse_path(inner)
}

fn parse_path(expression: &str) -> Option<TemplateRef> {
    let expression = expression.trim();
    let segments: Vec<&str> = expression.split('.').collect();
    if segments.len() < 2 {
        return None;
    }
    let valid = segments.iter().all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    let starts_like_identifier = segments[0]
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid || !starts_like_identifier {
        return None;
    }
    Some(TemplateRef {
        context_key: segments[..2].join("."),
        selector: segments[2..].join("."),
    })
}

/// JSON view of a context payload; bytes become UTF-8 text when possible, base64 otherwise
pub fn payload_to_json(payload: Payload) -> Value {
    match payload {
        Payload::Json(value) => value,
        Payload::Bytes(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes)),
        },
    }
}

/// Place `value` at the dotted `context_key` inside a render scope
pub fn scope_insert(scope: &mut Map<String, Value>, context_key: &str, value: Value) {
    let mut segments = context_key.split('.').peekable();
    let mut current = scope;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else { return };
        current = next;
    }
}

/// Render a template string against a scope
pub fn render(source: &str, scope: &Map<String, Value>) -> Result<String, minijinja::Error> {
    let env = Environment::new();
    env.render_str(source, minijinja::Value::from_serialize(scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_reference_is_typed() {
        let template = InputTemplate::parse(&json!("{{ fetch.output.user }}"));
        let InputTemplate::Reference { reference, .. } = template else {
            panic!("expected a reference");
        };
        assert_eq!(reference.context_key, "fetch.output");
        assert_eq!(reference.selector, "user");
    }

    #[test]
    fn filters_and_mixed_text_render() {
        let template = InputTemplate::parse(&json!("Hello {{ fetch.output.name | upper }} from {{ trigger.output.city }}"));
        let InputTemplate::Render { references, .. } = &template else {
            panic!("expected a render template");
        };
        let keys: Vec<&str> = references.iter().map(|r| r.context_key.as_str()).collect();
        assert_eq!(keys, vec!["fetch.output", "trigger.output"]);
    }

    #[test]
    fn statement_blocks_register_references() {
        let source = "{% for item in fetch.output.items %}{{ item.name }}-{{ loop.index }},{% endfor %}\
                      {% set total = stats.output.count %}{{ total }} {{ 'a.b' }}";
        let template = InputTemplate::parse(&json!(source));
        let keys: Vec<&str> = template.references().iter().map(|r| r.context_key.as_str()).collect();
        assert_eq!(keys, vec!["fetch.output", "stats.output"]);

        let mut scope = Map::new();
        scope_insert(&mut scope, "fetch.output", json!({"items": [{"name": "a"}, {"name": "b"}]}));
        scope_insert(&mut scope, "stats.output", json!({"count": 2}));
        let text = render(template.raw().unwrap(), &scope).unwrap();
        assert_eq!(text, "a-1,b-2,2 a.b");
    }

    #[test]
    fn literals_pass_through() {
        assert_eq!(InputTemplate::parse(&json!(42)), InputTemplate::Literal(json!(42)));
        assert_eq!(InputTemplate::parse(&json!("plain")), InputTemplate::Literal(json!("plain")));
        assert!(InputTemplate::parse(&json!("{{ 1 + 2 }}")).references().is_empty());
    }

    #[test]
    fn renders_against_nested_scope() {
        let mut scope = Map::new();
        scope_insert(&mut scope, "fetch.output", json!({"name": "ada"}));
        let text = render("Hi {{ fetch.output.name | upper }}", &scope).unwrap();
        assert_eq!(text, "Hi ADA");
    }
}
