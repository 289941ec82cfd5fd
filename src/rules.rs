//! The deck/board collaborator the host calls into.
//!
//! The replicator never decides *which* cards land on the board; it asks a
//! [`Dealer`]. [`StandardDealer`] is the stock 81-card implementation.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::card::{self, Board, Card, BOARD_SIZE};

/// How many reshuffles a dealer attempts to put at least one set on the board.
const MAX_DEAL_ATTEMPTS: usize = 16;

/// A deck with the board dealt from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deal {
    /// Remaining cards; the next card dealt is the *last* element.
    pub deck: Vec<Card>,
    pub board: Board,
}

impl Deal {
    /// Number of sets currently on the board.
    pub fn possible_sets(&self) -> usize {
        card::count_sets(&self.board)
    }
}

/// Source of decks and boards for the host.
///
/// Implementations must keep every card in exactly one of `deck` or `board`
/// (or discarded after a successful claim).
pub trait Dealer: Send + 'static {
    /// A fresh shuffled deck with a full board dealt from it.
    fn deal(&mut self) -> Deal;

    /// Replace the three claimed slots with cards from the deck. Slots stay
    /// empty once the deck is exhausted.
    fn replace(&mut self, deal: &mut Deal, slots: [usize; 3]);

    /// Return the board to the deck, shuffle, and deal a new board.
    fn reshuffle(&mut self, deal: &mut Deal);

    /// The set predicate. Defaults to [`card::is_set`].
    fn is_set(&self, a: Card, b: Card, c: Card) -> bool {
        card::is_set(a, b, c)
    }
}

/// The stock dealer: all 81 cards, shuffled with a seedable RNG.
#[derive(Debug)]
pub struct StandardDealer {
    rng: StdRng,
}

impl StandardDealer {
    /// A dealer seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// A reproducible dealer.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn fill_board(deck: &mut Vec<Card>, board: &mut Board) {
        for slot in board.iter_mut() {
            *slot = deck.pop();
        }
    }
}

impl Default for StandardDealer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dealer for StandardDealer {
    fn deal(&mut self) -> Deal {
        let mut deal = Deal {
            deck: Card::all().collect(),
            board: [None; BOARD_SIZE],
        };
        deal.deck.shuffle(&mut self.rng);
        Self::fill_board(&mut deal.deck, &mut deal.board);
        if deal.possible_sets() == 0 {
            self.reshuffle(&mut deal);
        }
        deal
    }

    fn replace(&mut self, deal: &mut Deal, slots: [usize; 3]) {
        for slot in slots {
            if let Some(entry) = deal.board.get_mut(slot) {
                *entry = deal.deck.pop();
            }
        }
    }

    fn reshuffle(&mut self, deal: &mut Deal) {
        for _ in 0..MAX_DEAL_ATTEMPTS {
            deal.deck
                .extend(deal.board.iter_mut().filter_map(Option::take));
            deal.deck.shuffle(&mut self.rng);
            Self::fill_board(&mut deal.deck, &mut deal.board);
            if deal.possible_sets() > 0 {
                return;
            }
        }
        tracing::debug!("no set found after {MAX_DEAL_ATTEMPTS} reshuffles");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_cards(deal: &Deal) -> HashSet<Card> {
        deal.deck
            .iter()
            .copied()
            .chain(deal.board.iter().flatten().copied())
            .collect()
    }

    #[test]
    fn fresh_deal_uses_every_card_once() {
        let deal = StandardDealer::with_seed(7).deal();
        assert_eq!(deal.deck.len(), 81 - BOARD_SIZE);
        assert!(deal.board.iter().all(Option::is_some));
        assert_eq!(all_cards(&deal).len(), 81);
        assert!(deal.possible_sets() > 0);
    }

    #[test]
    fn seeded_dealers_are_reproducible() {
        assert_eq!(
            StandardDealer::with_seed(3).deal(),
            StandardDealer::with_seed(3).deal()
        );
    }

    #[test]
    fn replace_pops_from_deck_and_empties_when_exhausted() {
        let mut dealer = StandardDealer::with_seed(1);
        let mut deal = dealer.deal();
        let before = deal.deck.len();
        dealer.replace(&mut deal, [0, 1, 2]);
        assert_eq!(deal.deck.len(), before - 3);

        deal.deck.clear();
        dealer.replace(&mut deal, [3, 4, 5]);
        assert!(deal.board[3..6].iter().all(Option::is_none));
    }

    #[test]
    fn reshuffle_keeps_card_population() {
        let mut dealer = StandardDealer::with_seed(11);
        let mut deal = dealer.deal();
        let cards = all_cards(&deal);
        dealer.reshuffle(&mut deal);
        assert_eq!(all_cards(&deal), cards);
    }
}
