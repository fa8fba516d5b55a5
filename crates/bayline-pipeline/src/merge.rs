//! Precedence-aware repair-plan merge.
//!
//! `merge_fragment` is a pure function: the base plan is never mutated and
//! applying the same overlay twice equals applying it once. That is what
//! lets the scheduler complete research siblings in any order — the
//! orchestrator sorts fragments by source tag and folds them in.

use bayline_types::{LaborSource, LaborSpec, RepairPlan, ResearchFragment, Tagged};

use bayline_sources::HistorySignal;

/// Labor replaces only when the incoming source ranks at or above the
/// current one; at equal rank the lexicographically smaller tag wins the
/// tie. Labor provenance therefore only ever upgrades.
fn labor_wins(incoming: LaborSource, current: Option<LaborSource>) -> bool {
    match current {
        None => true,
        Some(current) => {
            incoming.rank() < current.rank()
                || (incoming.rank() == current.rank() && incoming.as_str() <= current.as_str())
        }
    }
}

/// Words of length ≥ 2, lowercased. "O2" and "EGR" count; stray single
/// letters don't.
fn significant_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

fn shared_word_count(a: &str, b: &str) -> usize {
    let words_a = significant_words(a);
    let words_b = significant_words(b);
    words_a.iter().filter(|w| words_b.contains(w)).count()
}

pub fn merge_fragment(base: &RepairPlan, fragment: &ResearchFragment) -> RepairPlan {
    let mut next = base.clone();
    let source = fragment.source.as_str();

    // Labor: precedence-gated replacement.
    if let Some(incoming) = &fragment.labor {
        if incoming.hours > 0.0 && labor_wins(incoming.source, next.labor.as_ref().map(|l| l.source))
        {
            next.labor = Some(LaborSpec {
                hours: incoming.hours,
                source: incoming.source,
                category: incoming.category.clone(),
                lift_required: incoming.lift_required,
                notes: incoming.notes.clone(),
            });
        }
    }

    // Torque specs and tools: union; the incoming (later, higher-precedence)
    // source wins key conflicts, tagged with its platform.
    for (component, spec) in &fragment.torque_specs {
        next.torque_specs
            .insert(component.clone(), Tagged::new(spec.clone(), Some(source)));
    }
    for tool in &fragment.tools {
        next.tools
            .insert(tool.clone(), Tagged::new(tool.clone(), Some(source)));
    }

    // Diagnoses: corroborate matches, append genuinely new causes. Order of
    // the existing list is preserved.
    for incoming in &fragment.fixes {
        let matched = next.diagnoses.iter_mut().find(|existing| {
            shared_word_count(&existing.cause, &incoming.cause) >= 2
        });
        match matched {
            Some(existing) => {
                let corroborates = incoming.success_rate.unwrap_or(0.0) >= 0.5;
                if corroborates && !existing.identifix_corroborated {
                    existing.identifix_corroborated = true;
                    existing.confidence = (existing.confidence + 0.05).min(0.95);
                    if existing.primary {
                        next.confidence = existing.confidence;
                    }
                }
            }
            None => {
                let duplicate = next.diagnoses.iter().any(|d| {
                    d.cause.eq_ignore_ascii_case(&incoming.cause)
                });
                if !duplicate {
                    next.diagnoses.push(incoming.clone());
                }
            }
        }
    }

    // Parts: replacement only happens at seeding (empty base list).
    // Afterwards fragments may annotate but never re-order or truncate.
    if next.parts.is_empty() {
        if let Some(parts) = &fragment.parts {
            next.parts = parts.clone();
        }
    }
    for hint in &fragment.part_hints {
        let lowered = hint.name.to_lowercase();
        if let Some(part) = next
            .parts
            .iter_mut()
            .find(|p| p.name.to_lowercase().contains(&lowered) || lowered.contains(&p.name.to_lowercase()))
        {
            if part.position.is_none() {
                part.position = hint.position.clone();
            }
            if let Some(alt) = &hint.oem_alternative {
                if !part.search_terms.iter().any(|t| t == alt) {
                    part.search_terms.push(alt.clone());
                }
            }
        }
    }

    // Procedures and TSBs: append-dedup, stable order.
    for procedure in &fragment.procedures {
        if !next.procedures.contains(procedure) {
            next.procedures.push(procedure.clone());
        }
    }
    for tsb in &fragment.tsbs {
        if !next.tsbs.iter().any(|t| t.id == tsb.id) {
            next.tsbs.push(tsb.clone());
        }
    }

    next
}

/// Folds fragments in a deterministic order (sorted by source tag) so the
/// final plan is independent of completion order.
pub fn merge_all(base: &RepairPlan, fragments: &[ResearchFragment]) -> RepairPlan {
    let mut ordered: Vec<&ResearchFragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| a.source.cmp(&b.source));
    ordered
        .into_iter()
        .fold(base.clone(), |plan, fragment| merge_fragment(&plan, fragment))
}

/// Applies the prior-repair signal to the top diagnosis: a signed delta in
/// [-0.2, +0.2], with the result clamped to [0.05, 0.95]. Applied at most
/// once per plan.
pub fn apply_history(base: &RepairPlan, signal: &HistorySignal) -> RepairPlan {
    let mut next = base.clone();
    let delta = signal.delta.clamp(-0.2, 0.2);

    let top_is_primary = next.top_diagnosis().map(|d| d.primary).unwrap_or(false);
    let top_index = next
        .diagnoses
        .iter()
        .position(|d| d.primary)
        .or(if next.diagnoses.is_empty() { None } else { Some(0) });

    if let Some(index) = top_index {
        let diagnosis = &mut next.diagnoses[index];
        if !diagnosis.history_adjusted {
            diagnosis.confidence = (diagnosis.confidence + delta).clamp(0.05, 0.95);
            diagnosis.history_adjusted = true;
            if top_is_primary || index == 0 {
                next.confidence = diagnosis.confidence;
            }
        }
    }
    next
}
