// Bracket classification and downstream dependency lookup.
//
// Bracket tags are free-form strings set by whoever created the tournament.
// Classification applies a fixed precedence so that tags matching several
// categories ("losers_third_place") always resolve the same way:
//
//   third place > grand final > losers > winners > unknown

use crate::model::{BracketMatch, Match, Tournament};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BracketKind {
    ThirdPlace,
    GrandFinal,
    Losers,
    Winners,
    Unknown,
}

impl BracketKind {
    /// Classify a bracket tag.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        if tag.is_empty() {
            return BracketKind::Unknown;
        }
        if tag.contains("third") || tag.contains("3rd") || tag.contains("bronze") {
            BracketKind::ThirdPlace
        } else if tag.contains("grand") {
            BracketKind::GrandFinal
        } else if tag.contains("loser") || tag.contains("lower") {
            BracketKind::Losers
        } else if tag.contains("winner") || tag.contains("upper") || tag == "main" {
            BracketKind::Winners
        } else {
            BracketKind::Unknown
        }
    }

    /// Classify a match. The match's own tag wins over the tournament listing;
    /// the listing is only consulted when the match carries no tag.
    pub fn of_match(m: &Match, tournament: Option<&Tournament>) -> Self {
        m.bracket
            .as_deref()
            .or_else(|| {
                tournament
                    .and_then(|t| t.bracket_match(&m.id))
                    .and_then(|b| b.bracket.as_deref())
            })
            .map(BracketKind::from_tag)
            .unwrap_or(BracketKind::Unknown)
    }
}

/// Destination matches that depend on this match's result (where its winner
/// advances and, in double elimination, where its loser drops).
///
/// Links on the match itself take precedence; the tournament listing fills
/// links the match payload omits.
pub fn downstream_matches<'a>(m: &Match, tournament: &'a Tournament) -> Vec<&'a BracketMatch> {
    let listed = tournament.bracket_match(&m.id);
    let next = m
        .next_match_id
        .as_deref()
        .or_else(|| listed.and_then(|b| b.next_match_id.as_deref()));
    let loser_next = m
        .loser_next_match_id
        .as_deref()
        .or_else(|| listed.and_then(|b| b.loser_next_match_id.as_deref()));

    let mut out: Vec<&BracketMatch> = Vec::new();
    for id in [next, loser_next].into_iter().flatten() {
        if let Some(dep) = tournament.bracket_match(id) {
            if !out.iter().any(|d| d.id == dep.id) {
                out.push(dep);
            }
        }
    }
    out
}

/// True when any downstream dependent match already has a recorded result.
pub fn downstream_played(m: &Match, tournament: &Tournament) -> bool {
    downstream_matches(m, tournament)
        .iter()
        .any(|d| d.has_result())
}
