//! Stage 2: user-configured text substitution.
//!
//! Rules come from three sources (global, agent-bound, profile-bound), are
//! merged and sorted by priority, then applied per message filtered by role
//! and tail-depth. Only `Request`-targeted rules run here; `Render` rules
//! belong to the UI.

use async_trait::async_trait;
use regex::{Captures, Regex, RegexBuilder};
use tracing::debug;

use trellis_core::{RegexPreset, RegexRule, RuleBinding, SubstitutionMode};

use crate::context::{PipelineContext, SourceKind};
use crate::error::StageResult;
use crate::stage::PipelineStage;

pub struct RegexProcessor;

const STAGE: &str = "regex";

#[async_trait]
impl PipelineStage for RegexProcessor {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let mut merged: Vec<RegexRule> = Vec::new();
        collect_rules(ctx.input.global_regex, &mut merged);
        collect_rules(&ctx.input.agent.regex_config, &mut merged);
        if let Some(profile) = ctx.input.user_profile {
            collect_rules(&profile.regex_config, &mut merged);
        }
        merged.sort_by_key(|rule| rule.priority);

        let binding = ctx.input.session.regex_binding;
        let user_name = ctx
            .input
            .user_profile
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "User".to_string());
        let char_name = ctx.input.agent.name.clone();

        let len = ctx.messages.len();
        let mut applied = 0usize;
        for (i, message) in ctx.messages.iter_mut().enumerate() {
            // Depth is measured from the tail: 0 = last message.
            let depth = (len - 1 - i) as u32;

            // Message-bound sessions replay the rules captured at node
            // creation; everything else uses the current merged set.
            let bound;
            let rules: &[RegexRule] = match (binding, &message.bound_rules) {
                (RuleBinding::MessageBound, Some(snapshot))
                    if message.source.kind == SourceKind::SessionHistory =>
                {
                    bound = snapshot.clone();
                    &bound
                }
                _ => &merged,
            };

            let mut text = message.text();
            let mut changed = false;
            for rule in rules {
                if !rule.enabled || !rule.target_roles.contains(&message.role) {
                    continue;
                }
                if let Some(range) = &rule.depth_range {
                    if !range.contains(depth) {
                        continue;
                    }
                }
                match apply_rule(&text, rule, &user_name, &char_name) {
                    Some(next) => {
                        if next != text {
                            text = next;
                            changed = true;
                        }
                    }
                    None => {
                        debug!(rule = %rule.name, pattern = %rule.pattern, "regex: invalid pattern skipped");
                    }
                }
            }
            if changed {
                message.set_text(text);
                applied += 1;
            }
        }

        ctx.trace.push(
            STAGE,
            format!("{} rules, {} messages rewritten", merged.len(), applied),
        );
        Ok(())
    }
}

fn collect_rules(presets: &[RegexPreset], out: &mut Vec<RegexRule>) {
    for preset in presets.iter().filter(|p| p.enabled) {
        out.extend(
            preset
                .rules
                .iter()
                .filter(|r| r.enabled && r.apply_to == trellis_core::ApplyTarget::Request)
                .cloned(),
        );
    }
}

/// Apply one rule to `text`. Returns `None` when the pattern fails to parse.
fn apply_rule(text: &str, rule: &RegexRule, user_name: &str, char_name: &str) -> Option<String> {
    let re = build_regex(&rule.pattern, &rule.flags)?;
    let template = expand_template(&rule.replacement, rule.substitution, user_name, char_name);
    let trims = &rule.trim_from_captures;
    Some(
        re.replace_all(text, |caps: &Captures<'_>| {
            expand_captures(&template, caps, trims)
        })
        .into_owned(),
    )
}

fn build_regex(pattern: &str, flags: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .ok()
}

/// Expand `{{user}}` / `{{char}}` in the replacement according to the rule's
/// substitution mode.
fn expand_template(
    replacement: &str,
    mode: SubstitutionMode,
    user_name: &str,
    char_name: &str,
) -> String {
    match mode {
        SubstitutionMode::None => replacement.to_string(),
        SubstitutionMode::Raw => replacement
            .replace("{{user}}", user_name)
            .replace("{{char}}", char_name),
        SubstitutionMode::Escaped => replacement
            .replace("{{user}}", &regex::escape(user_name))
            .replace("{{char}}", &regex::escape(char_name)),
    }
}

/// Substitute `$0`..`$9` capture references (and `$$` as a literal dollar),
/// trimming the configured strings out of every captured group first.
fn expand_captures(template: &str, caps: &Captures<'_>, trims: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d) if d.is_ascii_digit() => {
                let index = d.to_digit(10).unwrap() as usize;
                chars.next();
                if let Some(group) = caps.get(index) {
                    let mut captured = group.as_str().to_string();
                    for trim in trims {
                        if !trim.is_empty() {
                            captured = captured.replace(trim.as_str(), "");
                        }
                    }
                    out.push_str(&captured);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{ApplyTarget, DepthRange, Role};

    fn rule(pattern: &str, replacement: &str) -> RegexRule {
        RegexRule {
            name: "r".to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: String::new(),
            target_roles: vec![Role::User, Role::Assistant],
            depth_range: None,
            apply_to: ApplyTarget::Request,
            substitution: SubstitutionMode::None,
            priority: 0,
            trim_from_captures: Vec::new(),
            enabled: true,
        }
    }

    #[test]
    fn literal_replacement() {
        let out = apply_rule("hello world", &rule("world", "there"), "U", "C").unwrap();
        assert_eq!(out, "hello there");
    }

    #[test]
    fn capture_reference_expansion() {
        let out = apply_rule("name: Alice", &rule(r"name: (\w+)", "hi $1!"), "U", "C").unwrap();
        assert_eq!(out, "hi Alice!");
    }

    #[test]
    fn capture_trimming() {
        let mut r = rule(r"\[(.*?)\]", "$1");
        r.trim_from_captures = vec!["OOC:".to_string()];
        let out = apply_rule("[OOC: note] rest", &r, "U", "C").unwrap();
        assert_eq!(out, " note rest");
    }

    #[test]
    fn raw_substitution_expands_variables() {
        let mut r = rule("you", "{{user}}");
        r.substitution = SubstitutionMode::Raw;
        let out = apply_rule("you are here", &r, "Alice", "Bot").unwrap();
        assert_eq!(out, "Alice are here");
    }

    #[test]
    fn escaped_substitution_escapes_metacharacters() {
        let mut r = rule("x", "{{user}}");
        r.substitution = SubstitutionMode::Escaped;
        let out = apply_rule("x", &r, "a.b", "C").unwrap();
        assert_eq!(out, r"a\.b");
    }

    #[test]
    fn case_insensitive_flag() {
        let mut r = rule("HELLO", "bye");
        r.flags = "i".to_string();
        let out = apply_rule("hello there", &r, "U", "C").unwrap();
        assert_eq!(out, "bye there");
    }

    #[test]
    fn dollar_escape_is_literal() {
        let out = apply_rule("price", &rule("price", "$$9.99"), "U", "C").unwrap();
        assert_eq!(out, "$9.99");
    }

    #[test]
    fn invalid_pattern_returns_none() {
        assert!(apply_rule("x", &rule("(unclosed", "y"), "U", "C").is_none());
    }

    #[test]
    fn depth_range_is_respected() {
        // Exercised at the stage level: a rule bounded to depth 0 must only
        // touch the last message.
        let r = DepthRange { min: 0, max: Some(0) };
        assert!(r.contains(0));
        assert!(!r.contains(1));
    }
}
