//! Cards, their compact integer code, and the set predicate.
//!
//! A card has four ternary attributes. On the wire it travels as a single
//! integer `((color*3 + shape)*3 + fill)*3 + count` in `0..=80`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Number of slots on the board.
pub const BOARD_SIZE: usize = 12;

/// Number of distinct cards (and therefore the size of a full deck).
pub const DECK_SIZE: usize = 81;

/// The board: fixed-size, slots may be empty once the deck runs out.
pub type Board = [Option<Card>; BOARD_SIZE];

/// One card. Every attribute is in `0..3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Card {
    color: u8,
    shape: u8,
    fill: u8,
    count: u8,
}

impl Card {
    /// Build a card from its attributes. Returns `None` if any attribute is
    /// outside `0..3`.
    pub fn new(color: u8, shape: u8, fill: u8, count: u8) -> Option<Self> {
        if [color, shape, fill, count].iter().all(|v| *v < 3) {
            Some(Self {
                color,
                shape,
                fill,
                count,
            })
        } else {
            None
        }
    }

    pub fn color(&self) -> u8 {
        self.color
    }

    pub fn shape(&self) -> u8 {
        self.shape
    }

    pub fn fill(&self) -> u8 {
        self.fill
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    fn attributes(&self) -> [u8; 4] {
        [self.color, self.shape, self.fill, self.count]
    }

    /// Encode as the wire integer.
    pub fn code(&self) -> u8 {
        ((self.color * 3 + self.shape) * 3 + self.fill) * 3 + self.count
    }

    /// Decode a wire integer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidCard`] for codes above 80.
    pub fn from_code(code: u8) -> Result<Self> {
        if usize::from(code) >= DECK_SIZE {
            return Err(SessionError::InvalidCard(code));
        }
        let count = code % 3;
        let fill = (code / 3) % 3;
        let shape = (code / 9) % 3;
        let color = code / 27;
        Ok(Self {
            color,
            shape,
            fill,
            count,
        })
    }

    /// All 81 cards in code order.
    pub fn all() -> impl Iterator<Item = Card> {
        (0..DECK_SIZE as u8).filter_map(|code| Card::from_code(code).ok())
    }
}

impl Serialize for Card {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Card {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Card::from_code(code).map_err(serde::de::Error::custom)
    }
}

/// `true` when, on every attribute, the three cards are all equal or all
/// different (equivalently, the attribute values sum to 0 mod 3).
pub fn is_set(a: Card, b: Card, c: Card) -> bool {
    a.attributes()
        .iter()
        .zip(b.attributes().iter())
        .zip(c.attributes().iter())
        .all(|((x, y), z)| (x + y + z) % 3 == 0)
}

/// Every slot triple `(i, j, k)`, `i < j < k`, whose occupied cards form a set.
pub fn find_sets(board: &[Option<Card>]) -> Vec<[usize; 3]> {
    let cards: Vec<(usize, Card)> = board
        .iter()
        .enumerate()
        .filter_map(|(slot, card)| card.map(|c| (slot, c)))
        .collect();
    let mut found = Vec::new();
    for (n, (i, a)) in cards.iter().enumerate() {
        for (m, (j, b)) in cards.iter().enumerate().skip(n + 1) {
            for (k, c) in cards.iter().skip(m + 1) {
                if is_set(*a, *b, *c) {
                    found.push([*i, *j, *k]);
                }
            }
        }
    }
    found
}

/// Number of possible sets on the board.
pub fn count_sets(board: &[Option<Card>]) -> usize {
    find_sets(board).len()
}

/// Encode a board for the wire (`None` for empty slots).
pub fn encode_board(board: &[Option<Card>]) -> Vec<Option<u8>> {
    board.iter().map(|slot| slot.map(|c| c.code())).collect()
}

/// Decode a wire board. Missing trailing slots are empty; extra slots are an error.
///
/// # Errors
///
/// Returns [`SessionError::InvalidCard`] for bad codes and
/// [`SessionError::MalformedResponse`] if more than [`BOARD_SIZE`] slots are given.
pub fn decode_board(codes: &[Option<u8>]) -> Result<Board> {
    if codes.len() > BOARD_SIZE {
        return Err(SessionError::MalformedResponse(format!(
            "board has {} slots (max {BOARD_SIZE})",
            codes.len()
        )));
    }
    let mut board: Board = [None; BOARD_SIZE];
    for (slot, code) in board.iter_mut().zip(codes.iter()) {
        *slot = code.map(Card::from_code).transpose()?;
    }
    Ok(board)
}

/// Decode a wire deck.
///
/// # Errors
///
/// Returns [`SessionError::InvalidCard`] for bad codes.
pub fn decode_deck(codes: &[u8]) -> Result<Vec<Card>> {
    codes.iter().map(|code| Card::from_code(*code)).collect()
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

    fn card(color: u8, shape: u8, fill: u8, count: u8) -> Card {
        Card::new(color, shape, fill, count).unwrap()
    }

    #[test]
    fn every_code_decodes_back_to_itself() {
        for code in 0..81u8 {
            assert_eq!(Card::from_code(code).unwrap().code(), code);
        }
        assert_eq!(Card::all().count(), DECK_SIZE);
    }

    #[test]
    fn code_matches_documented_formula() {
        let c = card(2, 1, 0, 2);
        assert_eq!(c.code(), ((2 * 3 + 1) * 3) * 3 + 2);
    }

    #[test]
    fn out_of_range_code_is_rejected() {
        assert!(matches!(
            Card::from_code(81),
            Err(SessionError::InvalidCard(81))
        ));
        assert!(Card::new(3, 0, 0, 0).is_none());
    }

    #[test]
    fn set_predicate() {
        // all different on every attribute
        assert!(is_set(card(0, 0, 0, 0), card(1, 1, 1, 1), card(2, 2, 2, 2)));
        // all same except count
        assert!(is_set(card(1, 1, 1, 0), card(1, 1, 1, 1), card(1, 1, 1, 2)));
        // two same, one different on color
        assert!(!is_set(card(0, 0, 0, 0), card(0, 1, 1, 1), card(1, 2, 2, 2)));
    }

    #[test]
    fn find_sets_skips_empty_slots() {
        let mut board: Board = [None; BOARD_SIZE];
        board[0] = Some(card(0, 0, 0, 0));
        board[5] = Some(card(1, 1, 1, 1));
        board[11] = Some(card(2, 2, 2, 2));
        assert_eq!(find_sets(&board), vec![[0, 5, 11]]);
        board[5] = None;
        assert_eq!(count_sets(&board), 0);
    }

    #[test]
    fn board_decoding_rejects_oversized_boards() {
        let codes = vec![Some(0u8); BOARD_SIZE + 1];
        assert!(decode_board(&codes).is_err());
    }

    #[test]
    fn board_decoding_pads_short_boards() {
        let board = decode_board(&[Some(4), None]).unwrap();
        assert_eq!(board[0], Some(Card::from_code(4).unwrap()));
        assert!(board[1..].iter().all(Option::is_none));
        assert_eq!(encode_board(&board)[0], Some(4));
    }

    #[test]
    fn card_serializes_as_code() {
        let c = card(1, 0, 2, 1);
        assert_eq!(serde_json::to_string(&c).unwrap(), c.code().to_string());
        assert!(serde_json::from_str::<Card>("99").is_err());
    }
}
