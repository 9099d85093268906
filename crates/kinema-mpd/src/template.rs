//! DASH URL template substitution (`$RepresentationID$`, `$Number%05d$`, ...).

/// Values available for substitution into a media/init template.
#[derive(Clone, Debug, Default)]
pub struct TemplateVars<'a> {
    pub representation_id: &'a str,
    pub number: i64,
    pub bandwidth: i64,
    pub time: i64,
    pub sub_number: i64,
}

fn format_width(value: i64, width: usize) -> String {
    let mut out = value.to_string();
    while out.len() < width {
        out.insert(0, '0');
    }
    out
}

/// Width from a `%0Nd` format tag; anything else (including absence) is
/// width 1.
fn parse_format_width(tag: &str) -> usize {
    if let Some(rest) = tag.strip_prefix('%') {
        if let Some(digits) = rest.strip_suffix('d') {
            if let Ok(w) = digits.parse::<usize>() {
                return w;
            }
        }
    }
    1
}

/// Substitute all `$...$` tokens. Returns `None` on an unknown identifier or
/// an unterminated token; callers treat that as an unusable representation.
pub fn substitute_template(template: &str, vars: &TemplateVars<'_>) -> Option<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while !rest.is_empty() {
        match rest.find('$') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(pos) => {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + 1..];
                let end = after.find('$')?;
                let token = &after[..end];
                rest = &after[end + 1..];
                if token.is_empty() {
                    // "$$" escapes a literal dollar sign.
                    out.push('$');
                } else if token == "RepresentationID" {
                    out.push_str(vars.representation_id);
                } else if let Some(fmt) = token.strip_prefix("Number") {
                    out.push_str(&format_width(vars.number, parse_format_width(fmt)));
                } else if let Some(fmt) = token.strip_prefix("Bandwidth") {
                    out.push_str(&format_width(vars.bandwidth, parse_format_width(fmt)));
                } else if let Some(fmt) = token.strip_prefix("Time") {
                    out.push_str(&format_width(vars.time, parse_format_width(fmt)));
                } else if let Some(fmt) = token.strip_prefix("SubNumber") {
                    out.push_str(&format_width(vars.sub_number, parse_format_width(fmt)));
                } else {
                    return None;
                }
            }
        }
    }
    Some(out)
}
