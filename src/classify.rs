/// Decides whether a message is asking for something the tenant's
/// relational data could answer. A positive classification only opens the
/// structured path; the guard and the generator still have to agree.
pub trait IntentClassifier: Send + Sync + 'static {
    fn wants_structured_data(&self, message: &str) -> bool;
}

/// Default classifier: a lexical cue list covering aggregation, quantity,
/// and listing vocabulary. Cheap, deterministic, and deliberately biased
/// toward false negatives: an ambiguous message falls through to
/// document retrieval alone.
pub struct LexicalClassifier {
    cues: Vec<&'static str>,
}

const DEFAULT_CUES: &[&str] = &[
    "how many",
    "how much",
    "number of",
    "count",
    "total",
    "sum",
    "average",
    "mean",
    "median",
    "maximum",
    "minimum",
    "highest",
    "lowest",
    "top ",
    "bottom ",
    "most recent",
    "latest",
    "oldest",
    "per month",
    "per year",
    "per quarter",
    "list all",
    "list the",
    "show all",
    "show me all",
    "breakdown",
    "compare",
    "percentage",
    "revenue",
    "headcount",
];

impl LexicalClassifier {
    pub fn new() -> Self {
        Self {
            cues: DEFAULT_CUES.to_vec(),
        }
    }

    pub fn with_cues(cues: Vec<&'static str>) -> Self {
        Self { cues }
    }
}

impl Default for LexicalClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier for LexicalClassifier {
    fn wants_structured_data(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.cues.iter().any(|cue| lowered.contains(cue))
    }
}
