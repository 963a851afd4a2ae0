//! Property tests for the termination history reducer.

use proptest::prelude::*;
use tower_groupchat::memory::{reduce, HistoryReducer};
use tower_groupchat::{Message, TruncationReducer};

fn conversation(contents: &[String]) -> Vec<Message> {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i % 2 == 0 {
                Message::user(c.clone())
            } else {
                Message::assistant("Agent", c.clone())
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn keeps_the_last_min_len_window_messages_in_order(
        contents in prop::collection::vec("[a-z]{0,8}", 0..20),
        window in 1usize..8,
    ) {
        let history = conversation(&contents);
        let before = history.clone();
        let reduced = TruncationReducer::new(window).reduce(&history);

        prop_assert_eq!(reduced.len(), history.len().min(window));
        prop_assert_eq!(reduced, &history[history.len() - reduced.len()..]);
        // The source conversation is untouched.
        prop_assert_eq!(&history, &before);
    }

    #[test]
    fn free_function_matches_reducer(
        contents in prop::collection::vec("[a-z]{0,8}", 0..20),
        window in 1usize..8,
    ) {
        let history = conversation(&contents);
        prop_assert_eq!(reduce(&history, window), TruncationReducer::new(window).reduce(&history));
    }
}
