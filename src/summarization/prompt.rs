//! Prompt templates for the map (chunk), reduce (combine) and explanation passes.

use super::{LengthHint, SummaryPass};

pub(crate) const SYSTEM_PROMPT: &str = "You summarize government documents such as budgets and policy papers into concise, factual prose. Prefer a neutral tone. Avoid speculation. Never invent figures that are not in the source.";

/// Thematic focus and output language shared by every prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSettings {
    /// Topics the summary should emphasize.
    pub focus: String,
    /// Language the summary is written in unless a call asks for another.
    pub language: String,
}

/// Build the user prompt for one summarization call.
pub(crate) fn build_prompt(settings: &PromptSettings, text: &str, hint: &LengthHint) -> String {
    let focus = &settings.focus;
    let language = hint.language.as_deref().unwrap_or(&settings.language);
    let max_words = hint.max_words;
    let min_words = hint.min_words;
    match hint.pass {
        SummaryPass::Chunk => format!(
            "The following is a section of a government document:\n\n{text}\n\nProvide a concise summary of this section in {language}, focusing on key points related to {focus}. Write between {min_words} and {max_words} words as a single paragraph."
        ),
        SummaryPass::Combine => format!(
            "The following are summaries of consecutive sections of a government document:\n\n{text}\n\nCombine them into one cohesive summary in {language} that keeps all key information about {focus}. Highlight policies, impacts and recommendations if present. Write at most {max_words} words as a single paragraph."
        ),
        SummaryPass::Explain => {
            let region = hint
                .region
                .as_deref()
                .map(|region| format!(" in {region}"))
                .unwrap_or_default();
            format!(
                "The following is a summary of a budget or policy document{region}:\n\n{text}\n\nExplain in {language}, using simple and accessible words, how it affects:\n1. Gender equality (women, girls and gender minorities)\n2. The reduction of inequalities (marginalized and vulnerable populations)\nBe specific about positive and negative impacts. Write for someone with limited literacy or technical knowledge, in at most {max_words} words."
            )
        }
    }
}
