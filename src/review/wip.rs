//! Work-in-progress title detection.

use super::Review;

/// Title prefixes that mark a review as work in progress.
const WIP_PREFIXES: [&str; 4] = ["[wip]", "[draft]", "wip", "draft"];

/// Report whether a title declares work in progress.
///
/// Matching is case-insensitive and anchored at the start of the title,
/// with or without a separator after the marker, so `[WIP] refactor`,
/// `WIP: fix`, and `Draft fix` all match while `[WIPER] fix` does not.
#[must_use]
pub fn is_wip_title(title: &str) -> bool {
    let lowered = title.to_lowercase();
    WIP_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

/// Drop reviews whose titles declare work in progress.
pub fn remove_wip(reviews: &mut Vec<Review>) {
    reviews.retain(|review| !is_wip_title(&review.title));
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::review::testing;

    #[rstest]
    #[case::bracketed_wip("[WIP] refactor the config loader", true)]
    #[case::bracketed_draft("[Draft] rework pagination", true)]
    #[case::wip_with_colon("WIP: fix flaky retry", true)]
    #[case::wip_with_space("wip fix flaky retry", true)]
    #[case::draft_with_colon("Draft: add caching", true)]
    #[case::lowercase_draft("draft add caching", true)]
    #[case::wip_run_on("WIPER cleanup", true)]
    #[case::bracketed_run_on("[WIPER] Add support for running sanity tests", false)]
    #[case::wip_mid_title("Fix WIP detection", false)]
    #[case::plain_title("Add support for Gerrit changes", false)]
    fn detects_wip_prefixes(#[case] title: &str, #[case] wip: bool) {
        assert_eq!(is_wip_title(title), wip);
    }

    #[rstest]
    fn retains_only_non_wip_reviews() {
        let mut reviews = vec![
            testing::review("[WIP] refactor"),
            testing::review("Add support for Gerrit changes"),
            testing::review("wip fix"),
        ];
        remove_wip(&mut reviews);
        let titles: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(titles, vec!["Add support for Gerrit changes"]);
    }
}
