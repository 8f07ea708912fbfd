// Derived score, winner resolution and side-choice inference.
//
// Everything here is a pure function of a `Match` so the displayed values can
// be recomputed at any time instead of being cached next to the counters they
// are derived from.

use crate::model::{MapResult, Match, Score, SelectionAction, SideId};

/// Count maps won by each side using strict comparison.
///
/// Maps with no reported points on either side are skipped rather than being
/// counted as a 0-0 draw.
pub fn map_wins(maps: &[MapResult]) -> Score {
    maps.iter()
        .filter(|m| m.is_reported())
        .fold(Score::default(), |mut acc, m| {
            let (p1, p2) = m.points();
            if p1 > p2 {
                acc.side1 += 1;
            } else if p2 > p1 {
                acc.side2 += 1;
            }
            acc
        })
}

/// The score shown for a match.
///
/// - no map results: the match-level counters;
/// - exactly one map: that map's points (match-level counters are often
///   stale placeholders in this case);
/// - several maps: maps won per side.
///
/// A single map that has not been reported yet carries no information, so
/// the match-level counters are used instead.
pub fn derived_score(m: &Match) -> Score {
    match m.map_results.as_slice() {
        [] => Score::new(m.score1, m.score2),
        [single] if !single.is_reported() => Score::new(m.score1, m.score2),
        [single] => {
            let (p1, p2) = single.points();
            Score::new(p1, p2)
        }
        maps => map_wins(maps),
    }
}

/// Winner implied by the scores alone, ignoring any explicit `winner_id`.
///
/// Higher derived score wins. On a tie with map data present, the map-win
/// count breaks it. Otherwise the winner stays undetermined.
pub fn winner_from_scores(m: &Match) -> Option<SideId> {
    let score = derived_score(m);
    let decisive = if !score.is_tied() {
        Some(score)
    } else if !m.map_results.is_empty() {
        Some(map_wins(&m.map_results)).filter(|wins| !wins.is_tied())
    } else {
        None
    }?;

    if decisive.side1 > decisive.side2 {
        m.side1_id.clone()
    } else {
        m.side2_id.clone()
    }
}

/// Resolved winner: an explicit `winner_id` is authoritative, otherwise the
/// scores decide.
pub fn resolve_winner(m: &Match) -> Option<SideId> {
    m.winner_id.clone().or_else(|| winner_from_scores(m))
}

/// Overwrite the match-level counters and winner with values derived from
/// the map results. Used before sending a map-score edit.
pub fn apply_derived(m: &mut Match) {
    let score = derived_score(m);
    m.score1 = score.side1;
    m.score2 = score.side2;
    m.winner_id = winner_from_scores(m);
}

/// Who chooses the starting side on a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChoice {
    /// The side that did not pick the map chooses.
    Chooser(SideId),
    /// The map was never picked (decider, or not part of the veto), or the
    /// picking side is not a participant of this match.
    Undetermined,
}

/// Infer which side chooses the starting side on `map_name`.
///
/// Uses the first pick of that map in the veto history. Deciders are left
/// undetermined instead of guessing from ban order.
pub fn side_choice(m: &Match, map_name: &str) -> SideChoice {
    let picked_by = m
        .selections
        .iter()
        .filter(|s| s.action_type == SelectionAction::Pick)
        .find(|s| s.map_name.eq_ignore_ascii_case(map_name))
        .map(|s| s.actor_side_id.as_str());

    match picked_by.and_then(|side| m.opponent_of(side)) {
        Some(chooser) => SideChoice::Chooser(chooser.clone()),
        None => SideChoice::Undetermined,
    }
}
