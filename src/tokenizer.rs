use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// ARC grids use ten color symbols. Everything above is special/role tokens.
pub const NUM_COLORS: u32 = 10;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const EOS_TOKEN: &str = "[EOS]";
pub const IM_START_TOKEN: &str = "<|im_start|>";
pub const IM_END_TOKEN: &str = "<|im_end|>";

pub const ROLES: [&str; 4] = ["system", "problem", "scratchpad", "solution"];

/// Grid tokenizer with a fixed, deterministically-built vocabulary:
/// colors 0..9, then the special tokens, then the role tokens.
#[derive(Debug)]
pub struct ArcTokenizer {
    vocab: HashMap<String, u32>,
    inverse_vocab: HashMap<u32, String>,
}

impl Default for ArcTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcTokenizer {
    pub fn new() -> Self {
        let mut vocab = HashMap::new();
        let mut inverse_vocab = HashMap::new();
        let mut token_id = 0u32;
        let mut push = |token: String| {
            vocab.insert(token.clone(), token_id);
            inverse_vocab.insert(token_id, token);
            token_id += 1;
        };

        for i in 0..NUM_COLORS {
            push(i.to_string());
        }
        for token in [PAD_TOKEN, UNK_TOKEN, EOS_TOKEN, IM_START_TOKEN, IM_END_TOKEN] {
            push(token.to_string());
        }
        for role in ROLES {
            push(role.to_string());
        }

        Self {
            vocab,
            inverse_vocab,
        }
    }

    /// Load a saved vocabulary. A vocabulary missing any special or role
    /// token is a fatal configuration error, so the id accessors can never
    /// panic on a loaded tokenizer.
    pub fn load(vocab_path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(vocab_path.as_ref())
            .with_context(|| format!("reading vocab from {:?}", vocab_path.as_ref()))?;
        let vocab: HashMap<String, u32> = serde_json::from_str(&content)?;

        let required = [PAD_TOKEN, UNK_TOKEN, EOS_TOKEN, IM_START_TOKEN, IM_END_TOKEN]
            .into_iter()
            .chain(ROLES);
        for token in required {
            if !vocab.contains_key(token) {
                return Err(anyhow!(
                    "vocabulary at {:?} is missing required token {token:?}",
                    vocab_path.as_ref()
                ));
            }
        }

        let inverse_vocab = vocab.iter().map(|(k, v)| (*v, k.clone())).collect();
        Ok(Self {
            vocab,
            inverse_vocab,
        })
    }

    pub fn save_vocab(&self, vocab_path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = vocab_path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.vocab)?;
        fs::write(vocab_path.as_ref(), content)
            .with_context(|| format!("writing vocab to {:?}", vocab_path.as_ref()))?;
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn pad_token_id(&self) -> u32 {
        self.vocab[PAD_TOKEN]
    }

    pub fn eos_token_id(&self) -> u32 {
        self.vocab[EOS_TOKEN]
    }

    pub fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32> {
        let unk = self.vocab[UNK_TOKEN];
        tokens
            .iter()
            .map(|t| self.vocab.get(t).copied().unwrap_or(unk))
            .collect()
    }

    pub fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|id| {
                self.inverse_vocab
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| UNK_TOKEN.to_string())
            })
            .collect()
    }

    /// Wrap a grid's row-major pixels in ChatML-style role markers:
    /// `<|im_start|> role p0 p1 ... <|im_end|>`.
    pub fn encode_grid_with_role(&self, grid: &[Vec<u32>], role: &str) -> Result<Vec<u32>> {
        if !ROLES.contains(&role) {
            return Err(anyhow!(
                "Unknown role: {role}. Available roles: {:?}",
                ROLES
            ));
        }

        let mut tokens = Vec::with_capacity(grid.iter().map(Vec::len).sum::<usize>() + 3);
        tokens.push(IM_START_TOKEN.to_string());
        tokens.push(role.to_string());
        for row in grid {
            for pixel in row {
                tokens.push(pixel.to_string());
            }
        }
        tokens.push(IM_END_TOKEN.to_string());

        Ok(self.convert_tokens_to_ids(&tokens))
    }
}

/// Pad id is fixed by the vocabulary layout; exported as a constant so the
/// data path and the loss masking never disagree with the tokenizer.
pub const PAD_TOKEN_ID: u32 = NUM_COLORS;
