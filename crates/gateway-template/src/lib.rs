//! Ollama-style prompt template substitution.
//!
//! Recognises conditional blocks `{{ if .X }}…{{ end }}` and variable
//! references `{{ .X }}` for X in {System, Prompt, Response}, with optional
//! whitespace-trim dashes (`{{- … -}}`). Substitution happens in two passes:
//! conditionals first (the entire span collapses to its body or nothing),
//! then variables left to right. With `break_early_on_response`, processing
//! halts at the first `{{ .Response }}` and the assistant seed is appended
//! verbatim, producing a prompt that continues rather than replays.
//!
//! Nested `{{ if }}` blocks are not interpreted; the inner text passes
//! through unchanged. That matches community model templates closely enough
//! in practice, and mis-nesting is reported rather than guessed at.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("malformed template: {0}")]
    Malformed(String),
}

/// One `{{ … }}` token in the raw template.
#[derive(Debug, PartialEq)]
enum Token<'a> {
    /// Literal text between delimiters.
    Text(&'a str),
    /// `{{ if .X }}`
    If(&'a str),
    /// `{{ end }}`
    End,
    /// `{{ .X }}`
    Var(&'a str),
}

fn tokenize(template: &str) -> Result<Vec<Token<'_>>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            TemplateError::Malformed("unterminated {{ delimiter".to_string())
        })?;

        let raw = after_open[..close].trim();
        let body = raw.trim_start_matches('-').trim_end_matches('-').trim();

        if let Some(var) = body.strip_prefix("if ") {
            tokens.push(Token::If(var.trim()));
        } else if body == "end" {
            tokens.push(Token::End);
        } else if body.starts_with('.') {
            tokens.push(Token::Var(body));
        } else {
            return Err(TemplateError::Malformed(format!(
                "unrecognised template directive: {{{{ {body} }}}}"
            )));
        }

        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }

    Ok(tokens)
}

fn value_for<'a>(
    var: &str,
    system: Option<&'a str>,
    prompt: Option<&'a str>,
    response: Option<&'a str>,
) -> Option<&'a str> {
    let present = |v: Option<&'a str>| v.filter(|s| !s.is_empty());
    match var {
        ".System" => present(system),
        ".Prompt" => present(prompt),
        ".Response" => present(response),
        _ => None,
    }
}

/// Substitutes a model template into a final prompt string.
pub fn apply_model_template(
    template: &str,
    system: Option<&str>,
    prompt: Option<&str>,
    response: Option<&str>,
    break_early_on_response: bool,
) -> Result<String, TemplateError> {
    // Pass 1: collapse conditional blocks. The span from `{{ if .X }}` to the
    // first following `{{ end }}` becomes its raw body (still containing
    // variable references) when the value is non-empty, or nothing.
    let tokens = tokenize(template)?;
    let mut flattened = String::with_capacity(template.len());
    let mut index = 0;
    while index < tokens.len() {
        match &tokens[index] {
            Token::Text(text) => flattened.push_str(text),
            Token::Var(var) => {
                flattened.push_str("{{ ");
                flattened.push_str(var);
                flattened.push_str(" }}");
            }
            // A stray end (e.g. the closer of a nested block whose opener was
            // consumed by the outer span) stays literal, like the original
            // template text it is.
            Token::End => flattened.push_str("{{ end }}"),
            Token::If(var) => {
                let end = tokens[index + 1..]
                    .iter()
                    .position(|t| matches!(t, Token::End))
                    .map(|offset| index + 1 + offset)
                    .ok_or_else(|| {
                        TemplateError::Malformed(format!(
                            "{{{{ if {var} }}}} without {{{{ end }}}}"
                        ))
                    })?;

                if value_for(var, system, prompt, response).is_some() {
                    for token in &tokens[index + 1..end] {
                        match token {
                            Token::Text(text) => flattened.push_str(text),
                            Token::Var(inner) => {
                                flattened.push_str("{{ ");
                                flattened.push_str(inner);
                                flattened.push_str(" }}");
                            }
                            // An inner `if` is not interpreted; keep its
                            // directive text so the limitation is visible.
                            Token::If(inner) => {
                                flattened.push_str("{{ if ");
                                flattened.push_str(inner);
                                flattened.push_str(" }}");
                            }
                            Token::End => unreachable!("bounded by the end search"),
                        }
                    }
                }
                index = end;
            }
        }
        index += 1;
    }

    // Pass 2: substitute variable references left to right.
    let tokens = tokenize(&flattened)?;
    let mut output = String::with_capacity(flattened.len());
    for token in &tokens {
        match token {
            Token::Text(text) => output.push_str(text),
            Token::If(var) => {
                // Leftover opener from an uninterpreted nested block.
                output.push_str("{{ if ");
                output.push_str(var);
                output.push_str(" }}");
            }
            Token::End => output.push_str("{{ end }}"),
            Token::Var(var) => {
                if *var == ".Response" && break_early_on_response {
                    output.push_str(response.unwrap_or_default());
                    return Ok(output);
                }
                if let Some(value) = value_for(var, system, prompt, response) {
                    output.push_str(value);
                }
            }
        }
    }

    Ok(output)
}
