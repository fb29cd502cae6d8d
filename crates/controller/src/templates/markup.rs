//! XML escaping and a structural well-formedness check for job definitions.
//!
//! The check covers what Jenkins needs to accept a `config.xml`: one root
//! element, balanced and correctly nested tags, quoted attributes and valid
//! entity references. It does not validate against any schema.

const PREDEFINED_ENTITIES: [&str; 5] = ["amp", "lt", "gt", "quot", "apos"];

/// Escape text for element content or attribute values.
#[must_use]
pub fn escape_markup(data: &str) -> String {
    let mut escaped = String::with_capacity(data.len());
    for c in data.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Check that `document` is a single well-formed XML element tree.
pub fn check_well_formed(document: &str) -> Result<(), String> {
    let bytes = document.as_bytes();
    let mut open: Vec<&str> = Vec::new();
    let mut seen_root = false;
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'<' => {
                let rest = &document[pos..];
                if rest.starts_with("<?") {
                    pos += skip_past(rest, "?>", "processing instruction")?;
                } else if rest.starts_with("<!--") {
                    pos += skip_past(rest, "-->", "comment")?;
                } else if rest.starts_with("<![CDATA[") {
                    if open.is_empty() {
                        return Err("CDATA section outside the root element".to_string());
                    }
                    pos += skip_past(rest, "]]>", "CDATA section")?;
                } else if rest.starts_with("<!") {
                    if seen_root {
                        return Err("declaration after the root element".to_string());
                    }
                    pos += skip_past(rest, ">", "declaration")?;
                } else if let Some(closing) = rest.strip_prefix("</") {
                    let end = closing
                        .find('>')
                        .ok_or_else(|| "unterminated closing tag".to_string())?;
                    let name = closing[..end].trim_end();
                    match open.pop() {
                        Some(expected) if expected == name => {}
                        Some(expected) => {
                            return Err(format!("expected </{expected}> but found </{name}>"));
                        }
                        None => return Err(format!("unexpected closing tag </{name}>")),
                    }
                    pos += 2 + end + 1;
                } else {
                    if open.is_empty() && seen_root {
                        return Err("document has more than one root element".to_string());
                    }
                    let end = tag_end(rest)?;
                    let inner = &rest[1..end];
                    let (inner, self_closing) = match inner.strip_suffix('/') {
                        Some(stripped) => (stripped, true),
                        None => (inner, false),
                    };
                    let name_len = inner.find(char::is_whitespace).unwrap_or(inner.len());
                    let name = &inner[..name_len];
                    check_name(name)?;
                    check_attributes(name, &inner[name_len..])?;
                    seen_root = true;
                    if !self_closing {
                        open.push(name);
                    }
                    pos += end + 1;
                }
            }
            b'&' => {
                if open.is_empty() {
                    return Err("entity reference outside the root element".to_string());
                }
                pos += check_entity(&document[pos..])?;
            }
            byte => {
                if open.is_empty() && !byte.is_ascii_whitespace() {
                    return Err("text outside the root element".to_string());
                }
                pos += 1;
            }
        }
    }

    if let Some(unclosed) = open.last() {
        return Err(format!("element <{unclosed}> is never closed"));
    }
    if !seen_root {
        return Err("document has no root element".to_string());
    }
    Ok(())
}

fn skip_past(rest: &str, terminator: &str, what: &str) -> Result<usize, String> {
    rest.find(terminator)
        .map(|index| index + terminator.len())
        .ok_or_else(|| format!("unterminated {what}"))
}

/// Index of the `>` closing the tag that starts `rest`, ignoring quoted text.
fn tag_end(rest: &str) -> Result<usize, String> {
    let mut quote: Option<u8> = None;
    for (index, byte) in rest.bytes().enumerate().skip(1) {
        match (quote, byte) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(byte),
            (None, b'<') => return Err("'<' inside a tag".to_string()),
            (None, b'>') => return Ok(index),
            (None, _) => {}
        }
    }
    Err("unterminated tag".to_string())
}

fn check_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => {}
        _ => return Err(format!("invalid element name '{name}'")),
    }
    if chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')) {
        Ok(())
    } else {
        Err(format!("invalid element name '{name}'"))
    }
}

fn check_attributes(element: &str, attributes: &str) -> Result<(), String> {
    let mut rest = attributes.trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value in <{element}>"))?;
        let name = rest[..eq].trim();
        check_name(name).map_err(|_| format!("invalid attribute name '{name}' in <{element}>"))?;

        let value_part = rest[eq + 1..].trim_start();
        let quote = value_part
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| format!("unquoted value for attribute '{name}' in <{element}>"))?;
        let close = value_part[1..]
            .find(quote)
            .ok_or_else(|| format!("unterminated value for attribute '{name}'"))?;
        let value = &value_part[1..=close];
        if value.contains('<') {
            return Err(format!("'<' in value of attribute '{name}'"));
        }
        let mut index = 0;
        while let Some(offset) = value[index..].find('&') {
            index += offset;
            index += check_entity(&value[index..])?;
        }
        rest = value_part[close + 2..].trim_start();
    }
    Ok(())
}

/// Validate the reference at the start of `rest`; returns its length.
fn check_entity(rest: &str) -> Result<usize, String> {
    let semi = rest
        .find(';')
        .filter(|index| *index <= 12)
        .ok_or_else(|| "bare '&' (use &amp;)".to_string())?;
    let body = &rest[1..semi];
    let valid = if let Some(hex) = body.strip_prefix("#x") {
        !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
    } else if let Some(decimal) = body.strip_prefix('#') {
        !decimal.is_empty() && decimal.chars().all(|c| c.is_ascii_digit())
    } else {
        PREDEFINED_ENTITIES.contains(&body)
    };
    if valid {
        Ok(semi + 1)
    } else {
        Err(format!("unknown entity '&{body};'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_markup_characters() {
        assert_eq!(
            escape_markup(r#"a & b < c > d "e" 'f'"#),
            "a &amp; b &lt; c &gt; d &quot;e&quot; &apos;f&apos;"
        );
    }

    #[test]
    fn accepts_jenkins_style_documents() {
        let document = r#"<?xml version='1.1' encoding='UTF-8'?>
<!-- managed elsewhere -->
<flow-definition plugin="workflow-job@2.40">
  <actions/>
  <description>build &amp; deploy &#169;</description>
  <definition class="org.jenkinsci.plugins.workflow.cps.CpsFlowDefinition">
    <script><![CDATA[node { sh 'echo <ok>' }]]></script>
    <sandbox>true</sandbox>
  </definition>
</flow-definition>
"#;
        assert_eq!(check_well_formed(document), Ok(()));
    }

    #[test]
    fn rejects_structural_errors() {
        let cases = [
            ("", "no root"),
            ("plain text", "text outside"),
            ("<a><b></a></b>", "expected </b>"),
            ("<a>", "never closed"),
            ("</a>", "unexpected closing"),
            ("<a/><b/>", "more than one root"),
            ("<a>fish & chips</a>", "bare '&'"),
            ("<a>&nbsp;</a>", "unknown entity"),
            ("<a href=x/>", "unquoted"),
            ("<a title=\"x</a>", "unterminated"),
            ("<1a/>", "invalid element name"),
        ];
        for (document, fragment) in cases {
            let err = check_well_formed(document).unwrap_err();
            assert!(err.contains(fragment), "{document:?}: {err}");
        }
    }

    #[test]
    fn quoted_angle_brackets_in_attributes_are_rejected() {
        assert!(check_well_formed(r#"<a title="1 > 0"/>"#).is_ok());
        assert!(check_well_formed(r#"<a title="1 < 0"/>"#).is_err());
    }
}
