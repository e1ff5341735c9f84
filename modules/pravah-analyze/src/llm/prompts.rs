//! Prompt text for the judge, merge and analysis calls.

use pravah_common::CandidateRecord;

pub const JUDGE_SYSTEM: &str = "\
You are a document analysis agent. Decide whether two texts (text1 and text2) are \
talking about the same event or topic. If they are, check whether text2 provides any \
information that text1 does not.

Answer with exactly one verdict:
- \"same\": both texts describe the same thing and text2 adds nothing.
- \"different\": the texts describe different events or topics.
- \"additional\": both describe the same thing and text2 adds information.";

pub const MERGE_SYSTEM: &str = "\
You are given two texts about the same event or topic. text2 carries information that \
text1 is missing. Write one combined text that keeps every detail from both. Do not \
give any reasoning; respond with the combined text only.";

pub const ANALYZE_SYSTEM: &str = "\
You are an analysis agent that turns raw scouted data into actionable insight for a \
city. Produce:
- category: one of traffic, weather, civic_issues, event
- location: a proper geographic location that can be used for geocoding
- severity: one of low, medium, high
- text: a concise summary of the data that keeps every important detail";

/// `existing` is text1 (already stored), `incoming` is text2.
pub fn judge_user(existing: &str, incoming: &str) -> String {
    format!("text1: {existing}\ntext2: {incoming}")
}

pub fn merge_user(existing: &str, incoming: &str) -> String {
    format!("text1: {existing}\ntext2: {incoming}")
}

pub fn analyze_user(item: &CandidateRecord) -> String {
    format!(
        "source: {}\nsource_id: {}\nlocation: {}\nengagement_count: {}\nfetched_at: {}\ncontent: {}",
        item.source,
        item.source_id,
        item.location,
        item.engagement_count,
        item.fetched_at.to_rfc3339(),
        item.content,
    )
}
