//! Graph name handling. Node, topic and service names live in a single
//! slash-separated namespace; this library resolves every name to its global
//! form and rejects anything the registry would choke on.

use anyhow::bail;

/// A node name must be global (`/talker`) and each segment must start with a
///  letter, continuing with letters, digits and underscores.
pub fn validate_node_name(name: &str) -> anyhow::Result<()> {
    if !name.starts_with('/') {
        bail!("node name {:?} must begin with '/'", name);
    }
    validate_segments(name)
}

/// Resolve a topic or service name to its global form: already-global names
///  are validated as-is, relative names are anchored at the root namespace.
pub fn resolve(name: &str) -> anyhow::Result<String> {
    let global = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    validate_segments(&global)?;
    Ok(global)
}

fn validate_segments(name: &str) -> anyhow::Result<()> {
    if name == "/" {
        bail!("the bare root namespace is not a usable name");
    }
    for segment in name[1..].split('/') {
        if segment.is_empty() {
            bail!("name {:?} has an empty segment", name);
        }
        let mut chars = segment.chars();
        let first = chars.next().expect("empty segments were just rejected");
        if !first.is_ascii_alphabetic() {
            bail!("segment {:?} of name {:?} must start with a letter", segment, name);
        }
        if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
            bail!("segment {:?} of name {:?} contains an invalid character {:?}", segment, name, bad);
        }
    }
    Ok(())
}
