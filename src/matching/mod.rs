//! Star-list matching: spatial index, match container, combinatorial
//! searches.

pub mod fast_finder;
pub mod list_match;
pub mod star_match;

pub use fast_finder::FastFinder;
pub use list_match::{
    list_match, list_match_collect, list_match_combinatorial, list_match_refine,
    list_match_with_order, list_matchup_shift, match_search_rot_shift,
    match_search_rot_shift_flip, MatchConditions, MatchConditionsBuilder,
};
pub use star_match::{StarMatch, StarMatchList};
