//! SentencePiece `tokenizer.model` import.
//!
//! Reads the serialized `ModelProto` (pieces, trainer spec, normalizer
//! spec) and rebuilds it as a HuggingFace tokenizer:
//!
//! - Unigram models keep their piece scores
//! - BPE models get merges derived from the piece vocabulary, ranked by
//!   the id of the merged piece
//!
//! Spaces are written as `▁` (U+2581) and restored on decode. Control and
//! user-defined pieces become added tokens so they match literally.

use crate::error::{PocketError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

/// File holding a serialized SentencePiece model.
pub const SENTENCEPIECE_FILE: &str = "tokenizer.model";

/// Word-boundary marker used in place of spaces.
const SPACE_MARKER: &str = "\u{2581}";

/// Role of a vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    /// Ordinary subword.
    Normal,
    /// The unknown-token piece.
    Unknown,
    /// Control symbol such as `<bos>`; never produced from text.
    Control,
    /// User-defined symbol matched verbatim.
    UserDefined,
    /// Reserved, never emitted.
    Unused,
    /// Byte-fallback piece `<0xNN>`.
    Byte,
}

impl PieceKind {
    fn from_proto(value: u64) -> Self {
        match value {
            2 => PieceKind::Unknown,
            3 => PieceKind::Control,
            4 => PieceKind::UserDefined,
            5 => PieceKind::Unused,
            6 => PieceKind::Byte,
            _ => PieceKind::Normal,
        }
    }
}

/// One vocabulary entry; its id is its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    /// Surface form, with `▁` for spaces.
    pub text: String,
    /// Log-probability (Unigram) or negated merge rank (BPE).
    pub score: f32,
    /// Role of the piece.
    pub kind: PieceKind,
}

/// Segmentation algorithm of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationKind {
    /// Viterbi over scored pieces.
    Unigram,
    /// Ranked pair merges.
    Bpe,
}

/// A decoded `tokenizer.model`.
#[derive(Debug, Clone)]
pub struct SentencePieceModel {
    /// Vocabulary in id order.
    pub pieces: Vec<Piece>,
    /// Segmentation algorithm.
    pub kind: SegmentationKind,
    /// Unknown characters become `<0xNN>` byte pieces.
    pub byte_fallback: bool,
    /// A `▁` is prepended to the input before segmentation.
    pub add_dummy_prefix: bool,
}

impl SentencePieceModel {
    /// Read and decode a `tokenizer.model` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            PocketError::TokenizerUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&data)
    }

    /// Decode a serialized `ModelProto`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ProtoReader::new(data);
        let mut pieces = Vec::new();
        let mut model_type = 1;
        let mut byte_fallback = false;
        let mut add_dummy_prefix = true;

        while reader.has_more() {
            let (field, wire_type) = reader.read_tag()?;
            match (field, wire_type) {
                (1, 2) => pieces.push(parse_piece(reader.read_bytes()?)?),
                (2, 2) => {
                    let mut trainer = ProtoReader::new(reader.read_bytes()?);
                    while trainer.has_more() {
                        match trainer.read_tag()? {
                            (3, 0) => model_type = trainer.read_varint()?,
                            (35, 0) => byte_fallback = trainer.read_varint()? != 0,
                            (_, wt) => trainer.skip(wt)?,
                        }
                    }
                }
                (3, 2) => {
                    let mut normalizer = ProtoReader::new(reader.read_bytes()?);
                    while normalizer.has_more() {
                        match normalizer.read_tag()? {
                            (3, 0) => add_dummy_prefix = normalizer.read_varint()? != 0,
                            (_, wt) => normalizer.skip(wt)?,
                        }
                    }
                }
                (_, wt) => reader.skip(wt)?,
            }
        }

        let kind = match model_type {
            1 => SegmentationKind::Unigram,
            2 => SegmentationKind::Bpe,
            other => {
                return Err(PocketError::TokenizerUnavailable(format!(
                    "unsupported SentencePiece model type {}",
                    other
                )))
            }
        };
        if pieces.is_empty() {
            return Err(PocketError::TokenizerUnavailable(
                "SentencePiece model has no pieces".to_string(),
            ));
        }
        debug!(
            pieces = pieces.len(),
            kind = ?kind,
            byte_fallback,
            add_dummy_prefix,
            "decoded SentencePiece model"
        );

        Ok(Self {
            pieces,
            kind,
            byte_fallback,
            add_dummy_prefix,
        })
    }

    /// Id of the unknown piece (0 when none is marked).
    pub fn unk_id(&self) -> usize {
        self.pieces
            .iter()
            .position(|p| p.kind == PieceKind::Unknown)
            .unwrap_or(0)
    }

    /// BPE merges `(left, right)` in rank order.
    ///
    /// Every split of a piece into two pieces that both exist is a merge,
    /// ranked by the merged piece's id.
    pub fn bpe_merges(&self) -> Vec<(String, String)> {
        let ids: HashMap<&str, usize> = self
            .pieces
            .iter()
            .enumerate()
            .map(|(id, p)| (p.text.as_str(), id))
            .collect();

        let mut merges: Vec<(usize, usize, usize, &str, &str)> = Vec::new();
        for (id, piece) in self.pieces.iter().enumerate() {
            if !matches!(piece.kind, PieceKind::Normal | PieceKind::UserDefined) {
                continue;
            }
            let text = piece.text.as_str();
            for (split, _) in text.char_indices().skip(1) {
                let (left, right) = text.split_at(split);
                if left.contains(' ') || right.contains(' ') {
                    continue;
                }
                if let (Some(&l), Some(&r)) = (ids.get(left), ids.get(right)) {
                    merges.push((id, l, r, left, right));
                }
            }
        }
        merges.sort_unstable();
        merges
            .into_iter()
            .map(|(_, _, _, l, r)| (l.to_string(), r.to_string()))
            .collect()
    }

    /// The equivalent `tokenizer.json` document.
    pub fn to_tokenizer_json(&self) -> Value {
        let unk_id = self.unk_id();
        let model = match self.kind {
            SegmentationKind::Unigram => {
                let vocab: Vec<Value> = self
                    .pieces
                    .iter()
                    .map(|p| json!([p.text, p.score]))
                    .collect();
                json!({
                    "type": "Unigram",
                    "unk_id": unk_id,
                    "vocab": vocab,
                    "byte_fallback": self.byte_fallback,
                })
            }
            SegmentationKind::Bpe => {
                let vocab: serde_json::Map<String, Value> = self
                    .pieces
                    .iter()
                    .enumerate()
                    .map(|(id, p)| (p.text.clone(), json!(id)))
                    .collect();
                let merges: Vec<String> = self
                    .bpe_merges()
                    .into_iter()
                    .map(|(l, r)| format!("{} {}", l, r))
                    .collect();
                json!({
                    "type": "BPE",
                    "dropout": null,
                    "unk_token": self.pieces[unk_id].text,
                    "continuing_subword_prefix": null,
                    "end_of_word_suffix": null,
                    "fuse_unk": true,
                    "byte_fallback": self.byte_fallback,
                    "vocab": vocab,
                    "merges": merges,
                })
            }
        };

        let added_tokens: Vec<Value> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                matches!(
                    p.kind,
                    PieceKind::Control | PieceKind::UserDefined | PieceKind::Unknown
                )
            })
            .map(|(id, p)| {
                json!({
                    "id": id,
                    "content": p.text,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": p.kind != PieceKind::UserDefined,
                })
            })
            .collect();

        let replace_spaces = json!({
            "type": "Replace",
            "pattern": { "String": " " },
            "content": SPACE_MARKER,
        });
        let normalizer = if self.add_dummy_prefix {
            json!({
                "type": "Sequence",
                "normalizers": [
                    { "type": "Prepend", "prepend": SPACE_MARKER },
                    replace_spaces,
                ],
            })
        } else {
            replace_spaces
        };

        let mut decoders = vec![
            json!({
                "type": "Replace",
                "pattern": { "String": SPACE_MARKER },
                "content": " ",
            }),
            json!({ "type": "ByteFallback" }),
            json!({ "type": "Fuse" }),
        ];
        if self.add_dummy_prefix {
            decoders.push(json!({ "type": "Strip", "content": " ", "start": 1, "stop": 0 }));
        }

        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": normalizer,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": { "type": "Sequence", "decoders": decoders },
            "model": model,
        })
    }

    /// Build the HuggingFace tokenizer.
    pub fn to_tokenizer(&self) -> Result<HfTokenizer> {
        let bytes = serde_json::to_vec(&self.to_tokenizer_json())?;
        HfTokenizer::from_bytes(bytes).map_err(|e| {
            PocketError::TokenizerUnavailable(format!(
                "cannot build tokenizer from SentencePiece model: {}",
                e
            ))
        })
    }
}

fn parse_piece(data: &[u8]) -> Result<Piece> {
    let mut reader = ProtoReader::new(data);
    let mut piece = Piece {
        text: String::new(),
        score: 0.0,
        kind: PieceKind::Normal,
    };
    while reader.has_more() {
        match reader.read_tag()? {
            (1, 2) => piece.text = reader.read_string()?,
            (2, 5) => piece.score = reader.read_f32()?,
            (3, 0) => piece.kind = PieceKind::from_proto(reader.read_varint()?),
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(piece)
}

/// Minimal protobuf wire-format cursor.
struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn has_more(&self) -> bool {
        self.pos < self.data.len()
    }

    fn read_tag(&mut self) -> Result<(u32, u32)> {
        let tag = self.read_varint()?;
        Ok(((tag >> 3) as u32, (tag & 0x7) as u32))
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| malformed("truncated varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(malformed("varint overflow"));
            }
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("field extends past end of data"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("piece is not UTF-8"))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, wire_type: u32) -> Result<()> {
        match wire_type {
            0 => self.read_varint().map(drop),
            1 => self.take(8).map(drop),
            2 => self.read_bytes().map(drop),
            5 => self.take(4).map(drop),
            other => Err(malformed(&format!("unsupported wire type {}", other))),
        }
    }
}

fn malformed(reason: &str) -> PocketError {
    PocketError::TokenizerUnavailable(format!("malformed tokenizer.model: {}", reason))
}

/// Serialize a minimal `ModelProto`; the inverse of
/// [`SentencePieceModel::from_bytes`] for the fields it reads.
pub fn encode_model_proto(model: &SentencePieceModel) -> Vec<u8> {
    fn varint(out: &mut Vec<u8>, mut value: u64) {
        while value >= 0x80 {
            out.push((value as u8) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
    }
    fn tag(out: &mut Vec<u8>, field: u64, wire_type: u64) {
        varint(out, (field << 3) | wire_type);
    }
    fn message(out: &mut Vec<u8>, field: u64, body: &[u8]) {
        tag(out, field, 2);
        varint(out, body.len() as u64);
        out.extend_from_slice(body);
    }

    let mut out = Vec::new();
    for piece in &model.pieces {
        let mut body = Vec::new();
        message(&mut body, 1, piece.text.as_bytes());
        tag(&mut body, 2, 5);
        body.extend_from_slice(&piece.score.to_le_bytes());
        let kind = match piece.kind {
            PieceKind::Normal => 1,
            PieceKind::Unknown => 2,
            PieceKind::Control => 3,
            PieceKind::UserDefined => 4,
            PieceKind::Unused => 5,
            PieceKind::Byte => 6,
        };
        tag(&mut body, 3, 0);
        varint(&mut body, kind);
        message(&mut out, 1, &body);
    }

    let mut trainer = Vec::new();
    tag(&mut trainer, 3, 0);
    varint(
        &mut trainer,
        match model.kind {
            SegmentationKind::Unigram => 1,
            SegmentationKind::Bpe => 2,
        },
    );
    tag(&mut trainer, 35, 0);
    varint(&mut trainer, u64::from(model.byte_fallback));
    message(&mut out, 2, &trainer);

    let mut normalizer = Vec::new();
    message(&mut normalizer, 1, b"identity");
    tag(&mut normalizer, 3, 0);
    varint(&mut normalizer, u64::from(model.add_dummy_prefix));
    message(&mut out, 3, &normalizer);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::synthetic;

    fn model(kind: SegmentationKind) -> SentencePieceModel {
        synthetic::sentencepiece_model(kind)
    }

    #[test]
    fn proto_fields_are_decoded() {
        let bytes = encode_model_proto(&model(SegmentationKind::Bpe));
        let decoded = SentencePieceModel::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.pieces, model(SegmentationKind::Bpe).pieces);
        assert_eq!(decoded.kind, SegmentationKind::Bpe);
        assert!(decoded.add_dummy_prefix);
        assert!(!decoded.byte_fallback);
        assert_eq!(decoded.unk_id(), 0);
    }

    #[test]
    fn truncated_proto_is_rejected() {
        let bytes = encode_model_proto(&model(SegmentationKind::Unigram));
        let err = SentencePieceModel::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, PocketError::TokenizerUnavailable(_)));
        assert!(SentencePieceModel::from_bytes(&[]).is_err());
    }

    #[test]
    fn bpe_merges_ranked_by_merged_id() {
        let merges = model(SegmentationKind::Bpe).bpe_merges();
        let m = |l: &str, r: &str| (l.to_string(), r.to_string());
        assert_eq!(
            merges,
            vec![
                m("\u{2581}", "f"),
                m("\u{2581}f", "i"),
                m("\u{2581}fi", "v"),
                m("\u{2581}fiv", "e"),
                m("\u{2581}", "s"),
                m("\u{2581}s", "i"),
                m("\u{2581}si", "x"),
            ]
        );
    }

    #[test]
    fn both_segmentations_encode_words() {
        for kind in [SegmentationKind::Unigram, SegmentationKind::Bpe] {
            let tokenizer = model(kind).to_tokenizer().unwrap();
            let encoding = tokenizer.encode("five six", false).unwrap();
            assert_eq!(encoding.get_ids(), &[13, 16], "{:?}", kind);
            assert_eq!(tokenizer.decode(&[1, 13, 16], true).unwrap(), "five six");
            assert_eq!(tokenizer.token_to_id("<eos>"), Some(2));
        }
    }
}
