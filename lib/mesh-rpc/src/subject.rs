//! Subject addressing

use mesh_api::InstanceDescriptor;

/// Suffix of the default binary encoding
pub const DEFAULT_SUFFIX: &str = "";
/// Suffix separating JSON traffic from binary traffic on the same channel
pub const JSON_SUFFIX: &str = "json";
/// Queue group used when none is given
pub const DEFAULT_QUEUE: &str = "queue";
/// Sub-path appended to a request subject to form its reply destination
pub const REPLY_PATH: &str = "reply";

/// Join path segments with `/`, skipping empty ones
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// `<prefix>/<type>/<id>[/<suffix>]`
pub fn direct(prefix: &str, server: &InstanceDescriptor, suffix: &str) -> String {
    join(&[prefix, &server.server_type, &server.server_id, suffix])
}

/// `<prefix>/<type>[/<suffix>]`
pub fn broadcast(prefix: &str, server_type: &str, suffix: &str) -> String {
    join(&[prefix, server_type, suffix])
}

/// `<prefix>/<type>/<queue>[/<suffix>]`
pub fn queue(prefix: &str, server_type: &str, queue: &str, suffix: &str) -> String {
    let queue = if queue.is_empty() { DEFAULT_QUEUE } else { queue };
    join(&[prefix, server_type, queue, suffix])
}

/// Reply destination for requests sent on `subject`
pub fn reply(subject: &str, caller_id: Option<&str>) -> String {
    join(&[subject, REPLY_PATH, caller_id.unwrap_or_default()])
}

/// Raw destination for queue-broker `send_msg`, `<prefix>_<destination>`
pub fn raw(prefix: &str, destination: &str) -> String {
    if prefix.is_empty() {
        destination.to_string()
    } else {
        format!("{}_{}", prefix, destination)
    }
}
