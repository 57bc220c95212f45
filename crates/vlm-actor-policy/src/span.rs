//! Locating the action field inside a generated thought + action continuation

use std::ops::Range;
use vlm_actor_core::MarkerConfig;

pub const MARKER_LEN: usize = 3;

/// Fewer generated tokens cannot hold a marker and are not scoreable
pub const MIN_OUTPUT_TOKENS: usize = 3;

/// Where the action span starts, as an index into the per-position log-probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionBoundary {
    /// End of the last occurrence of `template`
    Found { index: usize, template: [u32; MARKER_LEN] },

    /// No marker; the boundary sits `fallback_offset` valid positions from the end
    NotFoundFallback(usize),

    /// No marker and too few valid positions to guess
    Undeterminable,
}

impl ActionBoundary {
    pub fn index(&self) -> Option<usize> {
        match self {
            ActionBoundary::Found { index, .. } | ActionBoundary::NotFoundFallback(index) => {
                Some(*index)
            }
            ActionBoundary::Undeterminable => None,
        }
    }
}

/// Marker templates to search, highest priority first.
///
/// `token_texts[i]` is the decoded text of output token `i`; `None` when
/// per-token decoding failed. A token reading `primary_keyword` selects the
/// primary template and ends the scan; a token reading `derived_keyword`
/// with both neighbours present contributes the window around it. Without
/// either the secondary template leads.
pub fn template_order(
    output: &[u32],
    token_texts: Option<&[String]>,
    markers: &MarkerConfig,
) -> Vec<[u32; MARKER_LEN]> {
    let mut chosen = None;

    if let Some(texts) = token_texts {
        for (i, text) in texts.iter().enumerate() {
            let text = text.trim();
            if text == markers.primary_keyword {
                chosen = Some(markers.primary);
                break;
            }
            if text == markers.derived_keyword && i > 0 && i + 1 < output.len() {
                chosen = Some([output[i - 1], output[i], output[i + 1]]);
            }
        }
    }

    let mut order = Vec::with_capacity(3);
    order.push(chosen.unwrap_or(markers.secondary));
    for fixed in [markers.primary, markers.secondary] {
        if !order.contains(&fixed) {
            order.push(fixed);
        }
    }
    order
}

/// Find the action boundary in one row of output ids.
///
/// `valid` is the padding mask over the per-position log-probabilities
/// (output tokens `1..`). The first template with any match wins and its last
/// occurrence is used.
pub fn locate_action_boundary(
    output: &[u32],
    valid: &[bool],
    templates: &[[u32; MARKER_LEN]],
    fallback_offset: usize,
) -> ActionBoundary {
    for template in templates {
        if let Some(start) = output.windows(MARKER_LEN).rposition(|w| w == template) {
            return ActionBoundary::Found {
                index: start + MARKER_LEN,
                template: *template,
            };
        }
    }

    let valid_positions: Vec<usize> = valid
        .iter()
        .enumerate()
        .filter_map(|(i, &ok)| ok.then_some(i))
        .collect();

    if fallback_offset > 0 && valid_positions.len() >= fallback_offset {
        ActionBoundary::NotFoundFallback(valid_positions[valid_positions.len() - fallback_offset])
    } else {
        ActionBoundary::Undeterminable
    }
}

/// Thought and action ranges over `steps` per-position log-probabilities.
///
/// Thought covers `[1, m - 1)`, action `[m - 1, steps)`; both are clamped to
/// the available positions.
pub fn split_ranges(boundary: usize, steps: usize) -> (Range<usize>, Range<usize>) {
    let action_start = boundary.saturating_sub(1).min(steps);
    let thought_start = 1.min(action_start);
    (thought_start..action_start, action_start..steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u32 = 40;
    const B: u32 = 50;
    const C: u32 = 60;

    fn texts(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_primary_marker_boundary() {
        let markers = MarkerConfig::default();
        let output = [A, A, 330, 1335, 794, B, C];
        let valid = [true; 6];
        let boundary = locate_action_boundary(&output, &valid, &[markers.primary], 4);
        assert_eq!(
            boundary,
            ActionBoundary::Found {
                index: 5,
                template: [330, 1335, 794]
            }
        );
    }

    #[test]
    fn test_last_occurrence_wins() {
        let markers = MarkerConfig::default();
        let output = [330, 1335, 794, A, A, 330, 1335, 794, B, C];
        let boundary = locate_action_boundary(&output, &[true; 9], &[markers.primary], 4);
        assert_eq!(boundary.index(), Some(8));
    }

    #[test]
    fn test_first_template_with_a_match_wins() {
        let markers = MarkerConfig::default();
        let output = [330, 60599, 794, A, 330, 1335, 794, B];
        let order = [markers.secondary, markers.primary];
        let boundary = locate_action_boundary(&output, &[true; 7], &order, 4);
        assert_eq!(
            boundary,
            ActionBoundary::Found {
                index: 3,
                template: markers.secondary
            }
        );
    }

    #[test]
    fn test_fallback_skips_padding() {
        let output = [A, B, C, A, B, C, 0, 0];
        let valid = [true, true, true, true, true, false, false];
        let boundary = locate_action_boundary(&output, &valid, &[[330, 1335, 794]], 4);
        assert_eq!(boundary, ActionBoundary::NotFoundFallback(1));
    }

    #[test]
    fn test_undeterminable_with_few_valid_positions() {
        let output = [A, B, C, 0];
        let valid = [true, true, false];
        let boundary = locate_action_boundary(&output, &valid, &[[330, 1335, 794]], 4);
        assert_eq!(boundary, ActionBoundary::Undeterminable);
        assert_eq!(boundary.index(), None);
    }

    #[test]
    fn test_template_order_from_text() {
        let markers = MarkerConfig::default();
        let output = [A, 330, 1335, 794, B];

        let tokens = texts(&["I", " \"", "action", "\":", "x"]);
        let order = template_order(&output, Some(&tokens), &markers);
        assert_eq!(order, vec![markers.primary, markers.secondary]);

        let tokens = texts(&["I", " \"", "go", "\":", "x"]);
        let order = template_order(&output, Some(&tokens), &markers);
        assert_eq!(order, vec![markers.secondary, markers.primary]);

        let order = template_order(&output, None, &markers);
        assert_eq!(order, vec![markers.secondary, markers.primary]);
    }

    #[test]
    fn test_derived_template_uses_neighbours() {
        let markers = MarkerConfig::default();
        let output = [A, 7, 60599, 9, B];
        let order = template_order(&output, Some(&texts(&["a", "b", "formula", "c"])), &markers);
        assert_eq!(order, vec![[7, 60599, 9], markers.primary, markers.secondary]);

        // primary keyword later in the text overrides a derived window
        let tokens = texts(&["a", "formula", "action", "c"]);
        let order = template_order(&output, Some(&tokens), &markers);
        assert_eq!(order[0], markers.primary);
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(5, 6), (1..4, 4..6));
        assert_eq!(split_ranges(7, 6), (1..6, 6..6));
        assert_eq!(split_ranges(1, 6), (0..0, 0..6));
        assert_eq!(split_ranges(0, 6), (0..0, 0..6));
    }
}
