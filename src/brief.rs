//! Creative brief prompt construction and model-output parsing.
//!
//! The model is asked for a JSON object with fixed keys (concept, script,
//! hooks, cta, notes). Models often wrap JSON in markdown fences or add
//! prose around it, so parsing tries, in order: a ```json fence, a bare
//! ``` fence, the raw text. If none yields valid JSON the raw text is
//! preserved as the concept so a reply is never lost.

use serde_json::{json, Value};

use crate::models::{ProjectDuration, ProjectPurpose};

pub const BRIEF_SYSTEM_PROMPT: &str = "You are an expert short-form video strategist for \
e-commerce brands. You write creative briefs that convert: concrete hooks, tight scripts \
with timestamps, and clear calls to action. Respond with a single JSON object with the \
keys \"concept\", \"script\", \"hooks\", \"cta\", and \"notes\". \"hooks\" is an array of \
3-5 opening lines; every other value is a string. Do not include any text outside the \
JSON object.";

/// Inputs for one brief generation.
pub struct BriefRequest<'a> {
    pub product_name: &'a str,
    pub product_url: Option<&'a str>,
    pub purpose: Option<ProjectPurpose>,
    pub duration: Option<ProjectDuration>,
    pub tone: Option<&'a str>,
    pub reference_videos: &'a [String],
    pub additional_instructions: Option<&'a str>,
    pub shop_market: Option<&'a str>,
    pub shop_category: Option<&'a str>,
}

/// Render the user prompt for a brief generation.
pub fn build_prompt(req: &BriefRequest<'_>) -> String {
    let mut prompt = format!(
        "Write a creative brief for a short-form video promoting this product.\n\n\
         Product: {}\n",
        req.product_name
    );

    if let Some(url) = req.product_url {
        prompt.push_str(&format!("Product URL: {}\n", url));
    }
    if let Some(purpose) = req.purpose {
        prompt.push_str(&format!("Goal: {}\n", purpose.as_str()));
    }
    if let Some(duration) = req.duration {
        prompt.push_str(&format!("Target length: {}\n", duration.as_str()));
    }
    if let Some(tone) = req.tone {
        prompt.push_str(&format!("Tone: {}\n", tone));
    }
    if let Some(market) = req.shop_market {
        prompt.push_str(&format!("Market: {}\n", market));
    }
    if let Some(category) = req.shop_category {
        prompt.push_str(&format!("Shop category: {}\n", category));
    }
    if !req.reference_videos.is_empty() {
        prompt.push_str("Reference videos to take inspiration from:\n");
        for url in req.reference_videos {
            prompt.push_str(&format!("- {}\n", url));
        }
    }
    if let Some(extra) = req.additional_instructions {
        prompt.push_str(&format!("\nAdditional instructions:\n{}\n", extra));
    }

    prompt
}

/// Parse the model's reply into a structured brief.
///
/// Never fails: unparseable output is wrapped in a brief whose concept is
/// the raw text.
pub fn parse_brief(raw: &str) -> Value {
    for candidate in [
        extract_fenced(raw, "```json"),
        extract_fenced(raw, "```"),
        Some(raw.trim()),
    ]
    .into_iter()
    .flatten()
    {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(candidate) {
            return Value::Object(obj);
        }
    }

    json!({
        "concept": raw.trim(),
        "script": "",
        "hooks": [],
        "cta": "",
        "notes": "Model output was not valid JSON; raw text preserved in concept.",
    })
}

/// Contents of the first fenced block opened by `fence`, if any.
fn extract_fenced<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_includes_fields() {
        let req = BriefRequest {
            product_name: "LED Dog Collar",
            product_url: Some("https://shop.example/collar"),
            purpose: Some(ProjectPurpose::Sales),
            duration: Some(ProjectDuration::Medium30s),
            tone: Some("playful"),
            reference_videos: &["https://vid.example/1".to_string()],
            additional_instructions: Some("Mention the USB charging."),
            shop_market: Some("US"),
            shop_category: Some("Pet Supplies"),
        };
        let prompt = build_prompt(&req);
        assert!(prompt.contains("LED Dog Collar"));
        assert!(prompt.contains("Goal: sales"));
        assert!(prompt.contains("Target length: 30s"));
        assert!(prompt.contains("https://vid.example/1"));
        assert!(prompt.contains("USB charging"));
    }

    #[test]
    fn test_parse_json_fenced() {
        let raw = "Here is the brief:\n```json\n{\"concept\":\"c\",\"script\":\"s\",\"hooks\":[\"h\"],\"cta\":\"buy\",\"notes\":\"\"}\n```\nDone.";
        let brief = parse_brief(raw);
        assert_eq!(brief["concept"], "c");
        assert_eq!(brief["hooks"][0], "h");
    }

    #[test]
    fn test_parse_bare_fence() {
        let raw = "```\n{\"concept\":\"x\"}\n```";
        let brief = parse_brief(raw);
        assert_eq!(brief["concept"], "x");
    }

    #[test]
    fn test_parse_raw_json() {
        let brief = parse_brief("  {\"concept\":\"raw\"}  ");
        assert_eq!(brief["concept"], "raw");
    }

    #[test]
    fn test_parse_fallback_preserves_text() {
        let brief = parse_brief("Sorry, here is a plain-text brief instead.");
        assert_eq!(brief["concept"], "Sorry, here is a plain-text brief instead.");
        assert!(brief["notes"].as_str().unwrap().contains("not valid JSON"));
    }

    #[test]
    fn test_parse_non_object_json_falls_through() {
        // A bare array is valid JSON but not a brief.
        let brief = parse_brief("[1, 2, 3]");
        assert_eq!(brief["concept"], "[1, 2, 3]");
    }
}
