//! Wire convention for automated probes.
//!
//! Every probe is sent as a protected evaluation whose printed reply ends with
//! `<label:L><discard:yes|no>`. A failed evaluation prints [`NO_RESULT`] followed by
//! the same suffix, so a reply can always be correlated even when the remote throws.

pub const NO_RESULT: &str = "no result";

/// Echo prefix the remote uses for continuation lines of a multi-line command.
pub const MULTILINE_PREFIX: &str = "_ ";

const LABEL_OPEN: &str = "<label:";
const DISCARD_YES: &str = "<discard:yes>";
const DISCARD_NO: &str = "<discard:no>";

/// Turns an opaque expression into the text actually written to the channel.
pub trait Envelope {
    fn wrap(&self, expression: &str, label: &str, discard: bool) -> String;
}

/// Envelope for a Lua-style console. The expression travels as a quoted chunk so the
/// probe stays on one line while its own line structure (and any trailing `--`
/// comment) is preserved; a chunk that fails to compile takes the `no result` branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaEnvelope;

impl Envelope for LuaEnvelope {
    fn wrap(&self, expression: &str, label: &str, discard: bool) -> String {
        let suffix = suffix(label, discard);
        format!(
            "local __f = (loadstring or load)({chunk}) local __ok, __r = false, nil \
             if __f then __ok, __r = pcall(__f) end \
             if __ok then print(tostring(__r) .. {tag}) \
             else print({failed}) end",
            chunk = lua_string(&format!("return (\n{expression}\n)")),
            tag = lua_string(&suffix),
            failed = lua_string(&format!("{NO_RESULT}{suffix}")),
        )
    }
}

pub fn wrap(expression: &str, label: &str, discard: bool) -> String {
    LuaEnvelope.wrap(expression, label, discard)
}

pub fn suffix(label: &str, discard: bool) -> String {
    let discard = if discard { DISCARD_YES } else { DISCARD_NO };
    format!("{LABEL_OPEN}{label}>{discard}")
}

/// Double-quoted Lua literal. Line breaks become escapes: a raw one would be echoed
/// as a continuation line and read as a human multi-line command.
fn lua_string(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            c if c.is_ascii_control() => quoted.push_str(&format!("\\{:03}", c as u32)),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// A reply split into its value text and its correlation suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedReply<'a> {
    pub body: &'a str,
    pub label: &'a str,
    pub discard: bool,
}

impl TaggedReply<'_> {
    pub fn is_no_result(&self) -> bool {
        self.body.trim() == NO_RESULT
    }
}

/// Parses the `<label:L><discard:yes|no>` suffix at the end of `text`.
pub fn parse_reply(text: &str) -> Option<TaggedReply<'_>> {
    let trimmed = text.trim_end();
    let (rest, discard) = if let Some(rest) = trimmed.strip_suffix(DISCARD_YES) {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_suffix(DISCARD_NO) {
        (rest, false)
    } else {
        return None;
    };

    let rest = rest.strip_suffix('>')?;
    let open = rest.rfind(LABEL_OPEN)?;
    let label = &rest[open + LABEL_OPEN.len()..];
    if label.is_empty() || label.contains('<') {
        return None;
    }

    Some(TaggedReply {
        body: &rest[..open],
        label,
        discard,
    })
}

/// True when the text carries a label marker anywhere, e.g. the echo of a wrapped probe.
pub fn has_label_marker(text: &str) -> bool {
    text.contains(LABEL_OPEN)
}

pub fn is_multiline_echo(text: &str) -> bool {
    text.starts_with(MULTILINE_PREFIX)
}
