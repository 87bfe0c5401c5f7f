//! # lgen-tokenizer
//!
//! Tokenization for lgen.
//!
//! This crate provides:
//! - A `Tokenizer` trait bound to one loaded model's vocabulary
//! - Streaming decoding that never splits a multi-byte UTF-8 character
//! - A byte-level reference vocabulary used by the reference engine and tests

use std::collections::HashMap;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Every loaded model exposes its own implementation;
/// vocabularies are not interchangeable across models.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs, optionally prepending the beginning-of-sequence marker.
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>>;

    /// Append the raw bytes of one token's piece to `out`.
    ///
    /// Pieces are bytes, not text: a single piece may hold half of a
    /// multi-byte character. Marker tokens append nothing. On error `out`
    /// is left untouched.
    fn token_bytes(&self, token: TokenId, out: &mut Vec<u8>) -> TokenizerResult<()>;

    /// Number of entries in the vocabulary.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence marker, if the vocabulary defines one.
    fn bos_token(&self) -> Option<TokenId>;

    /// End-of-sequence marker.
    fn eos_token(&self) -> TokenId;

    /// Decode a single token against streaming state.
    ///
    /// Returns only complete characters; bytes of a character that is still
    /// incomplete stay buffered in `state` until a later token finishes it.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        self.token_bytes(token, &mut state.pending_utf8)?;
        Ok(state.drain_complete())
    }

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut state = DecodingState::new();
        let mut text = String::new();
        for &token in tokens {
            text.push_str(&self.decode_token(token, &mut state)?);
        }
        text.push_str(&state.finish());
        Ok(text)
    }
}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    /// Leading bytes of a character no token has finished yet.
    pending_utf8: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether bytes of an unfinished character are waiting for more input.
    pub fn has_pending(&self) -> bool {
        !self.pending_utf8.is_empty()
    }

    /// Feed raw bytes and return every character they complete.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(bytes);
        self.drain_complete()
    }

    /// Flush whatever is still pending. An unfinished character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        tail
    }

    pub fn clear(&mut self) {
        self.pending_utf8.clear();
    }

    fn drain_complete(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(complete) => {
                    out.push_str(complete);
                    self.pending_utf8.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_utf8[..valid]));
                    match err.error_len() {
                        // Incomplete trailing character: keep it for the next token.
                        None => {
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                        // Bytes that can never start a valid character.
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        out
    }
}

/// Byte-level reference vocabulary.
///
/// Layout:
/// - `0` beginning-of-sequence marker, `1` end-of-sequence marker
/// - `2..=257` one token per byte value, so any text is encodable
/// - `258..` multi-byte pieces, matched greedily (longest first)
///
/// Deterministic and lossless: decoding the encoding of any string yields the
/// string back, which makes it the golden tokenizer for pipeline tests.
#[derive(Debug, Clone)]
pub struct ByteLevelTokenizer {
    pieces: Vec<Vec<u8>>,
    piece_ids: HashMap<Vec<u8>, TokenId>,
    max_piece_len: usize,
}

impl ByteLevelTokenizer {
    pub const BOS_ID: TokenId = 0;
    pub const EOS_ID: TokenId = 1;
    pub const BYTE_OFFSET: TokenId = 2;
    pub const FIRST_PIECE_ID: TokenId = Self::BYTE_OFFSET + 256;

    /// Byte tokens only.
    pub fn new() -> Self {
        Self::with_pieces(std::iter::empty::<String>())
    }

    /// Build a vocabulary from multi-byte pieces.
    ///
    /// Pieces of fewer than two bytes are already covered by byte tokens and
    /// are skipped, as are duplicates.
    pub fn with_pieces<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokenizer = Self {
            pieces: Vec::new(),
            piece_ids: HashMap::new(),
            max_piece_len: 1,
        };
        for piece in pieces {
            let bytes = piece.into().into_bytes();
            if bytes.len() < 2 || tokenizer.piece_ids.contains_key(&bytes) {
                continue;
            }
            let id = Self::FIRST_PIECE_ID + tokenizer.pieces.len() as TokenId;
            tokenizer.max_piece_len = tokenizer.max_piece_len.max(bytes.len());
            tokenizer.piece_ids.insert(bytes.clone(), id);
            tokenizer.pieces.push(bytes);
        }
        tokenizer
    }

    /// Token ID for a single byte.
    pub fn byte_token(byte: u8) -> TokenId {
        Self::BYTE_OFFSET + byte as TokenId
    }

    /// Token ID of a multi-byte piece, if it is in the vocabulary.
    pub fn piece_id(&self, piece: &str) -> Option<TokenId> {
        self.piece_ids.get(piece.as_bytes()).copied()
    }

    /// Number of multi-byte pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

impl Default for ByteLevelTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteLevelTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len() + 1);
        if add_bos {
            ids.push(Self::BOS_ID);
        }

        let mut pos = 0;
        while pos < bytes.len() {
            let longest = self.max_piece_len.min(bytes.len() - pos);
            let matched = (2..=longest).rev().find_map(|len| {
                self.piece_ids
                    .get(&bytes[pos..pos + len])
                    .map(|&id| (id, len))
            });
            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    ids.push(Self::byte_token(bytes[pos]));
                    pos += 1;
                }
            }
        }

        Ok(ids)
    }

    fn token_bytes(&self, token: TokenId, out: &mut Vec<u8>) -> TokenizerResult<()> {
        match token {
            Self::BOS_ID | Self::EOS_ID => Ok(()),
            t if (Self::BYTE_OFFSET..Self::FIRST_PIECE_ID).contains(&t) => {
                out.push((t - Self::BYTE_OFFSET) as u8);
                Ok(())
            }
            t if t >= Self::FIRST_PIECE_ID => {
                let piece = self
                    .pieces
                    .get((t - Self::FIRST_PIECE_ID) as usize)
                    .ok_or(TokenizerError::InvalidToken(t))?;
                out.extend_from_slice(piece);
                Ok(())
            }
            t => Err(TokenizerError::InvalidToken(t)),
        }
    }

    fn vocab_size(&self) -> usize {
        Self::FIRST_PIECE_ID as usize + self.pieces.len()
    }

    fn bos_token(&self) -> Option<TokenId> {
        Some(Self::BOS_ID)
    }

    fn eos_token(&self) -> TokenId {
        Self::EOS_ID
    }
}
