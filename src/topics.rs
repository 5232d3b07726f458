//! Jobs topic names and MQTT topic-filter matching.
//!
//! All jobs topics live under `$aws/things/<thing>/jobs/`. Request topics have
//! `/accepted` and `/rejected` response siblings.

/// Single-level MQTT wildcard. Used to subscribe to update responses for any job.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Which half of a request/response pair a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Accepted,
    Rejected,
}

impl Response {
    fn suffix(self) -> &'static str {
        match self {
            Response::Accepted => "accepted",
            Response::Rejected => "rejected",
        }
    }
}

/// Builds jobs topic names for one thing.
#[derive(Debug, Clone)]
pub struct JobTopics {
    prefix: String,
}

impl JobTopics {
    pub fn new(thing_name: &str) -> Self {
        Self {
            prefix: format!("$aws/things/{thing_name}/jobs"),
        }
    }

    pub fn get_pending(&self) -> String {
        format!("{}/get", self.prefix)
    }

    pub fn get_pending_response(&self, response: Response) -> String {
        format!("{}/get/{}", self.prefix, response.suffix())
    }

    pub fn start_next(&self) -> String {
        format!("{}/start-next", self.prefix)
    }

    pub fn start_next_response(&self, response: Response) -> String {
        format!("{}/start-next/{}", self.prefix, response.suffix())
    }

    /// `job_id` may be [`SINGLE_LEVEL_WILDCARD`] when building a filter.
    pub fn update(&self, job_id: &str) -> String {
        format!("{}/{job_id}/update", self.prefix)
    }

    pub fn update_response(&self, job_id: &str, response: Response) -> String {
        format!("{}/{job_id}/update/{}", self.prefix, response.suffix())
    }

    pub fn notify_next(&self) -> String {
        format!("{}/notify-next", self.prefix)
    }
}

/// A request topic parsed back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    GetPending { thing: String },
    StartNext { thing: String },
    Update { thing: String, job_id: String },
}

/// Parse a jobs request topic (`get`, `start-next`, `<job>/update`).
pub fn parse_request_topic(topic: &str) -> Option<ParsedTopic> {
    let rest = topic.strip_prefix("$aws/things/")?;
    let (thing, rest) = rest.split_once("/jobs/")?;
    if thing.is_empty() {
        return None;
    }
    let thing = thing.to_string();
    match rest.split('/').collect::<Vec<_>>().as_slice() {
        ["get"] => Some(ParsedTopic::GetPending { thing }),
        ["start-next"] => Some(ParsedTopic::StartNext { thing }),
        [job_id, "update"] if !job_id.is_empty() => Some(ParsedTopic::Update {
            thing,
            job_id: job_id.to_string(),
        }),
        _ => None,
    }
}

/// Extract the job id from an update response topic
/// (`$aws/things/<thing>/jobs/<job>/update/accepted`).
pub fn job_id_from_update_response(topic: &str) -> Option<&str> {
    let mut levels = topic.rsplit('/');
    let _response = levels.next()?;
    if levels.next()? != "update" {
        return None;
    }
    levels.next().filter(|id| !id.is_empty())
}

/// MQTT topic-filter matching with `+` (one level) and `#` (remaining levels).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
