/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::collections::VecDeque;

use ahash::AHashMap;

use crate::{CompiledRule, CompiledRuleset, Conf, Matcher, TEST_RULE_SCORE};

const MAX_RULE_NAME: usize = 200;
const LONG_RULE_NAME: usize = 50;

fn valid_rule_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Conf {
    /// Reclassify every accumulated rule into its typed table, resolve the
    /// four-slot score vectors, validate meta references and reject cycles.
    /// Consumes the parse-time state; the result is immutable thereafter.
    pub fn finish_parsing(mut self) -> CompiledRuleset {
        let mut compiled = Vec::new();

        let rules = std::mem::take(&mut self.rules);
        for (name, rule) in rules {
            if matches!(rule.matcher, Matcher::None) {
                self.warn(format!("score or attribute declared for nonexistent rule {name}"));
                continue;
            }
            if !valid_rule_name(&name) || name.len() > MAX_RULE_NAME {
                self.warn(format!("invalid rule name {name:?}"));
                continue;
            }
            if name.len() > LONG_RULE_NAME {
                tracing::warn!(context = "config", "rule name {name:?} is overly long");
            }

            let scores = match rule.scores.as_deref() {
                Some([score]) => [*score; 4],
                Some([a, b, c, d]) => [*a, *b, *c, *d],
                Some(other) => {
                    self.warn(format!(
                        "score for {name} needs one or four values, got {}",
                        other.len()
                    ));
                    [other.first().copied().unwrap_or(1.0); 4]
                }
                None => {
                    let default = if name.starts_with("__") {
                        0.0
                    } else if name.starts_with("T_") {
                        TEST_RULE_SCORE
                    } else if rule.tflags.nice {
                        -1.0
                    } else {
                        1.0
                    };
                    [default; 4]
                }
            };

            compiled.push(CompiledRule {
                name,
                matcher: rule.matcher,
                tflags: rule.tflags,
                priority: rule.priority,
                description: rule.description.unwrap_or_default(),
                scores,
            });
        }

        // Hash-map iteration order must not leak into rule ordering.
        compiled.sort_by(|a, b| a.name.cmp(&b.name));

        // Meta rules: every referenced name must exist, reference chains must
        // be acyclic, and a meta never runs before anything it references.
        let known: AHashMap<String, usize> = compiled
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.name.clone(), idx))
            .collect();
        let mut dropped: Vec<usize> = Vec::new();
        let mut meta_order: Vec<usize> = Vec::new();
        {
            // Kahn's algorithm over meta → referenced-meta edges.
            let mut edges: AHashMap<usize, Vec<usize>> = AHashMap::new();
            let mut indegree: AHashMap<usize, usize> = AHashMap::new();
            for (idx, rule) in compiled.iter().enumerate() {
                let Matcher::Meta(expr) = &rule.matcher else {
                    continue;
                };
                indegree.entry(idx).or_insert(0);
                for referenced in expr.referenced_rules() {
                    match known.get(referenced) {
                        Some(ref_idx) => {
                            if matches!(compiled[*ref_idx].matcher, Matcher::Meta(_)) {
                                edges.entry(*ref_idx).or_default().push(idx);
                                *indegree.entry(idx).or_insert(0) += 1;
                            }
                        }
                        None => {
                            self.warn(format!(
                                "meta rule {} references unknown rule {referenced}",
                                rule.name
                            ));
                            dropped.push(idx);
                        }
                    }
                }
            }
            let mut ready: Vec<usize> = indegree
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(idx, _)| *idx)
                .collect();
            ready.sort_unstable();
            let mut ready: VecDeque<usize> = ready.into();
            let mut remaining = indegree.len();
            while let Some(idx) = ready.pop_front() {
                meta_order.push(idx);
                remaining -= 1;
                if let Some(next) = edges.get(&idx) {
                    for next in next.clone() {
                        if let Some(count) = indegree.get_mut(&next) {
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(next);
                            }
                        }
                    }
                }
            }
            if remaining > 0 {
                for (idx, count) in indegree {
                    if count > 0 {
                        self.warn(format!(
                            "meta rule {} participates in a reference cycle",
                            compiled[idx].name
                        ));
                        dropped.push(idx);
                    }
                }
            }
        }
        meta_order.retain(|idx| !dropped.contains(idx));

        // A meta runs at no lower a priority than anything it references.
        for idx in meta_order.clone() {
            let Matcher::Meta(expr) = &compiled[idx].matcher else {
                unreachable!()
            };
            let floor = expr
                .referenced_rules()
                .filter_map(|name| known.get(name))
                .map(|ref_idx| compiled[*ref_idx].priority)
                .max()
                .unwrap_or(i32::MIN);
            if floor > compiled[idx].priority {
                compiled[idx].priority = floor;
            }
        }

        let mut out = CompiledRuleset {
            settings: self.settings.clone(),
            addrlists: self.addrlists.clone(),
            templates: self.templates.clone(),
            ..Default::default()
        };

        for idx in meta_order {
            out.meta.push(compiled[idx].clone());
        }
        for (idx, rule) in compiled.into_iter().enumerate() {
            if dropped.contains(&idx) {
                continue;
            }
            if !rule.is_subrule() {
                out.scores.insert(rule.name.clone(), rule.scores);
            }
            if !rule.description.is_empty() {
                out.descriptions
                    .insert(rule.name.clone(), rule.description.clone());
            }
            let table = match &rule.matcher {
                Matcher::Header { .. } | Matcher::HeaderExists { .. } => &mut out.head,
                Matcher::HeaderEval(_) => &mut out.head_eval,
                Matcher::Body(_) => &mut out.body,
                Matcher::BodyEval(_) => &mut out.body_eval,
                Matcher::Rawbody(_) => &mut out.rawbody,
                Matcher::RawbodyEval(_) => &mut out.rawbody_eval,
                Matcher::Uri(_) => &mut out.uri,
                Matcher::Full(_) => &mut out.full,
                Matcher::FullEval(_) => &mut out.full_eval,
                Matcher::RblEval(_) => &mut out.rbl_eval,
                Matcher::RblResultEval(_) => &mut out.rbl_result_eval,
                Matcher::Meta(_) => continue,
                Matcher::None => unreachable!(),
            };
            table.push(rule);
        }

        for table in [
            &mut out.head,
            &mut out.body,
            &mut out.rawbody,
            &mut out.uri,
            &mut out.full,
            &mut out.head_eval,
            &mut out.body_eval,
            &mut out.rawbody_eval,
            &mut out.full_eval,
            &mut out.rbl_eval,
            &mut out.rbl_result_eval,
        ] {
            table.sort_by_key(|rule| rule.priority);
        }
        out.meta.sort_by_key(|rule| rule.priority);

        out.parse_errors = self.errors;
        out.lint_messages = std::mem::take(&mut self.lint_messages);

        out
    }
}

#[cfg(test)]
mod tests {
    use crate::{Conf, Matcher};

    fn compiled(config: &str) -> crate::CompiledRuleset {
        let mut conf = Conf::new();
        conf.parse(config, false);
        assert_eq!(conf.errors, 0, "{:?}", conf.lint_messages);
        conf.finish_parsing()
    }

    #[test]
    fn score_defaulting() {
        let rules = compiled(
            "header PLAIN Subject =~ /a/\n\
             header T_TESTING Subject =~ /b/\n\
             header NICE Subject =~ /c/\n\
             tflags NICE nice\n\
             header EXPLICIT Subject =~ /d/\n\
             score EXPLICIT 0.1 0.2 0.3 0.4\n\
             header BROADCAST Subject =~ /e/\n\
             score BROADCAST 2.0\n",
        );
        assert_eq!(rules.scores["PLAIN"], [1.0; 4]);
        assert_eq!(rules.scores["T_TESTING"], [0.01; 4]);
        assert_eq!(rules.scores["NICE"], [-1.0; 4]);
        assert_eq!(rules.scores["EXPLICIT"], [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(rules.scores["BROADCAST"], [2.0; 4]);
    }

    #[test]
    fn subrules_do_not_score() {
        let rules = compiled(
            "header __SUB Subject =~ /a/\n\
             meta TOP __SUB\n",
        );
        assert!(!rules.scores.contains_key("__SUB"));
        assert!(rules.scores.contains_key("TOP"));
    }

    #[test]
    fn meta_cycle_is_rejected() {
        let mut conf = Conf::new();
        conf.parse(
            "meta A B\n\
             meta B A\n\
             header OK Subject =~ /x/\n",
            false,
        );
        let rules = conf.finish_parsing();
        assert!(rules.meta.is_empty());
        assert_eq!(rules.head.len(), 1);
    }

    #[test]
    fn meta_order_follows_references() {
        let rules = compiled(
            "meta OUTER INNER && __BASE\n\
             meta INNER __BASE\n\
             header __BASE Subject =~ /x/\n",
        );
        let names: Vec<&str> = rules.meta.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["INNER", "OUTER"]);
    }

    #[test]
    fn meta_priority_floor() {
        let rules = compiled(
            "header __LATE Subject =~ /x/\n\
             priority __LATE 100\n\
             meta EARLY __LATE\n\
             priority EARLY -10\n",
        );
        assert_eq!(rules.meta[0].priority, 100);
    }

    #[test]
    fn unknown_meta_reference_drops_rule() {
        let mut conf = Conf::new();
        conf.parse("meta GHOST NO_SUCH_RULE\n", false);
        let rules = conf.finish_parsing();
        assert!(rules.meta.is_empty());
    }

    #[test]
    fn scoreset_index() {
        use crate::CompiledRuleset;
        assert_eq!(CompiledRuleset::scoreset_index(false, false), 0);
        assert_eq!(CompiledRuleset::scoreset_index(true, false), 1);
        assert_eq!(CompiledRuleset::scoreset_index(false, true), 2);
        assert_eq!(CompiledRuleset::scoreset_index(true, true), 3);
    }

    #[test]
    fn long_names_are_rejected() {
        let mut conf = Conf::new();
        let name = "X".repeat(201);
        conf.parse(&format!("header {name} Subject =~ /x/\n"), false);
        let rules = conf.finish_parsing();
        assert!(rules.head.is_empty());
    }

    #[test]
    fn bad_rule_name_detected() {
        let mut conf = Conf::new();
        conf.parse("header 9BAD Subject =~ /x/\n", false);
        assert_eq!(conf.errors, 0);
        let rules = conf.finish_parsing();
        assert!(rules.head.is_empty());
    }

    #[test]
    fn rules_grouped_and_sorted_by_priority() {
        let rules = compiled(
            "body LAST /a/\n\
             priority LAST 10\n\
             body FIRST /b/\n\
             priority FIRST -10\n\
             header HDR Subject =~ /c/\n",
        );
        assert_eq!(rules.body[0].name, "FIRST");
        assert_eq!(rules.body[1].name, "LAST");
        assert!(matches!(rules.head[0].matcher, Matcher::Header { .. }));
    }
}
