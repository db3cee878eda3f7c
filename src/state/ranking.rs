use super::ClickLedger;
use crate::types::*;

/// Order every roster member by click time, earliest first.
///
/// Members without a click sort after all real timestamps. The sort is stable,
/// so equal timestamps and non-clickers keep roster order. Clicks from
/// identities not on the roster are ignored.
pub fn rank(roster: &[Participant], clicks: &ClickLedger) -> Vec<RankedParticipant> {
    let mut ranking: Vec<RankedParticipant> = roster
        .iter()
        .map(|p| RankedParticipant {
            id: p.id.clone(),
            display_name: p.display_name.clone(),
            timestamp: clicks.get(&p.id),
        })
        .collect();

    ranking.sort_by_key(|r| (r.timestamp.is_none(), r.timestamp));
    ranking
}

/// Rank and designate the last entry as loser. `None` for an empty roster.
pub fn outcome(roster: &[Participant], clicks: &ClickLedger) -> Option<Outcome> {
    let ranking = rank(roster, clicks);
    let loser = ranking.last()?.clone();
    Some(Outcome { loser, ranking })
}
