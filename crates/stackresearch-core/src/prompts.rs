//! Prompt templates for each stage of the research loop.

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

const QUERY_WRITER: &str = "You are a technical research query generator tasked with creating targeted search queries to gather information about optimal technology choices.

Here is the project description: {project_description}

Generate at most {max_search_queries} search queries that will help determine the best tech stack according to this schema:

<schema>
{info}
</schema>

<user_requirements>
{user_requirements}
</user_requirements>

Your queries should:
1. Focus on finding recent, real-world implementations of similar systems
2. Target technical blogs, architecture discussions, and case studies
3. Include specific technical requirements mentioned in the project description
4. Search for scalability, performance, and integration patterns
5. Look for comparisons between relevant technology choices

Create focused queries that will help identify the most suitable technologies for this specific use case.";

const INFO: &str = "You are researching technology stack recommendations for a project with this description: {project_description}

The following schema shows the type of information we need to recommend:

<schema>
{info}
</schema>

You have just gathered technical content. Your task is to take clear, organized notes about relevant technology choices and patterns.

<Content>
{content}
</Content>

Here are the specific user requirements:
<user_requirements>
{user_requirements}
</user_requirements>

Please provide detailed research notes that:
1. Focus on concrete technology choices and their trade-offs
2. Note specific versions, compatibility requirements, and integration patterns
3. Capture performance characteristics and scalability considerations
4. Include real-world usage examples and case studies when available
5. Highlight any potential challenges or limitations
6. Consider how well each technology aligns with the project requirements

Remember: Don't try to format the output to match the schema yet - just take clear notes that capture all relevant technical information.";

const EXTRACTION: &str = "Your task is to take notes gathered from technical research and extract them into a recommended tech stack following this schema.

<schema>
{info}
</schema>

Here are all the notes from research:

<research_notes>
{notes}
</research_notes>

Focus on making concrete, justified recommendations based on the research. Each technology choice should be supported by evidence from the research notes.";

const REFLECTION: &str = "You are a technical architect tasked with reviewing the completeness and suitability of a proposed tech stack.

Compare the recommended stack with the required schema and project requirements:

<Schema>
{schema}
</Schema>

Here are the current recommendations:
<recommendations>
{info}
</recommendations>

Analyze if the recommendations are complete and well-justified. Consider:
1. Are all required technology choices specified and justified?
2. Do the recommendations align well with the project requirements?
3. Are there any missing components or integration gaps?
4. Are the justifications based on concrete evidence and research?
5. Have all major technical risks been considered?
6. Is there sufficient information about deployment and scaling?";

pub const QUERY_WRITER_USER: &str =
    "Please generate a list of search queries to find optimal technology choices.";
pub const EXTRACTION_USER: &str = "Based on the research notes, recommend a concrete tech stack that matches the requirements.";
pub const REFLECTION_USER: &str =
    "Evaluate the completeness and justification of the tech stack recommendations.";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("valid placeholder regex"));

/// Substitute every `{key}` in one pass; inserted values are never rescanned.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// User requirements as they appear inside prompts.
pub fn render_requirements(requirements: Option<&Value>) -> String {
    match requirements {
        None | Some(Value::Null) => "None provided".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => pretty(other),
    }
}

pub fn query_writer(
    project_description: &str,
    schema: &Value,
    requirements: Option<&Value>,
    max_search_queries: u8,
) -> String {
    fill(
        QUERY_WRITER,
        &[
            ("project_description", project_description),
            ("max_search_queries", &max_search_queries.to_string()),
            ("info", &pretty(schema)),
            ("user_requirements", &render_requirements(requirements)),
        ],
    )
}

pub fn info(
    project_description: &str,
    schema: &Value,
    content: &str,
    requirements: Option<&Value>,
) -> String {
    fill(
        INFO,
        &[
            ("project_description", project_description),
            ("info", &pretty(schema)),
            ("content", content),
            ("user_requirements", &render_requirements(requirements)),
        ],
    )
}

pub fn extraction(schema: &Value, notes: &str) -> String {
    fill(EXTRACTION, &[("info", &pretty(schema)), ("notes", notes)])
}

pub fn reflection(schema: &Value, info: &Value) -> String {
    fill(REFLECTION, &[("schema", &pretty(schema)), ("info", &pretty(info))])
}

/// Concatenate notes from every research round, numbered from 1.
pub fn format_notes(notes: &[String]) -> String {
    let rule = "=".repeat(60);
    let mut output = String::new();
    for (idx, note) in notes.iter().enumerate() {
        let _ = write!(
            output,
            "\n{rule}\nNote: {}:\n{rule}\nNotes from research:\n{note}",
            idx + 1
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_writer_fills_every_placeholder() {
        let prompt = query_writer(
            "A realtime chat app",
            &json!({"type": "object"}),
            Some(&json!({"budget": "low"})),
            4,
        );
        assert!(prompt.contains("A realtime chat app"));
        assert!(prompt.contains("at most 4 search queries"));
        assert!(prompt.contains("\"budget\": \"low\""));
        assert!(!prompt.contains("{info}"));
        assert!(!prompt.contains("{user_requirements}"));
    }

    #[test]
    fn scraped_content_is_not_templated() {
        let prompt = info(
            "Blog",
            &json!({}),
            "page mentions {project_description} literally",
            None,
        );
        assert!(prompt.contains("page mentions {project_description} literally"));
        assert!(prompt.contains("None provided"));
    }

    #[test]
    fn description_placeholders_do_not_capture_content() {
        let prompt = info("A CMS with {content} blocks", &json!({}), "SCRAPED-PAGES", None);
        assert!(prompt.contains("this description: A CMS with {content} blocks"));
        assert!(prompt.contains("<Content>\nSCRAPED-PAGES\n</Content>"));
        assert_eq!(prompt.matches("SCRAPED-PAGES").count(), 1);
    }

    #[test]
    fn schema_placeholders_do_not_capture_notes_or_info() {
        let schema = json!({"description": "summarise {notes} here, see {info}"});

        let prompt = extraction(&schema, "NOTE-TEXT");
        assert!(prompt.contains("<research_notes>\nNOTE-TEXT\n</research_notes>"));
        assert!(prompt.contains("summarise {notes} here"));
        assert_eq!(prompt.matches("NOTE-TEXT").count(), 1);

        let prompt = reflection(&schema, &json!({"backend": "INFO-VALUE"}));
        assert!(prompt.contains("see {info}"));
        assert_eq!(prompt.matches("INFO-VALUE").count(), 1);
    }

    #[test]
    fn notes_are_numbered_from_one() {
        let notes = vec!["first".to_string(), "second".to_string()];
        let formatted = format_notes(&notes);
        assert!(formatted.contains("Note: 1:"));
        assert!(formatted.contains("Note: 2:"));
        assert!(formatted.find("first") < formatted.find("second"));
        assert_eq!(format_notes(&[]), "");
    }

    #[test]
    fn string_requirements_are_inlined() {
        assert_eq!(
            render_requirements(Some(&json!("must run on-prem"))),
            "must run on-prem"
        );
    }
}
