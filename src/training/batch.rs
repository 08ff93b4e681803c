//! Tokenized training examples and device batches

use candle_core::{Device, Tensor};

use crate::{error::Result, model::TextTokenizer};

/// Texts are tokenized this many at a time
const TOKENIZE_CHUNK: usize = 100;

/// Every example padded or truncated to the same length
#[derive(Debug, Clone)]
pub struct TokenizedCorpus {
    input_ids: Vec<Vec<u32>>,
    attention_masks: Vec<Vec<u8>>,
    max_length: usize,
}

/// A training batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, max_length) u32
    pub input_ids: Tensor,
    /// Next-token targets; the same ids as the input, shifted inside the loss
    pub labels: Tensor,
    /// (batch, max_length) f32, 1 for real tokens and 0 for padding
    pub attention_mask: Tensor,
    /// Longest unpadded example in the batch
    pub span: usize,
    /// Number of predicted (non-padding) target tokens
    pub target_tokens: usize,
}

impl TokenizedCorpus {
    pub fn build(tokenizer: &TextTokenizer, texts: &[String], max_length: usize) -> Result<Self> {
        let mut input_ids = Vec::with_capacity(texts.len());
        let mut attention_masks = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(TOKENIZE_CHUNK) {
            let padded = tokenizer.encode_padded(chunk, max_length)?;
            input_ids.extend(padded.token_ids);
            attention_masks.extend(padded.attention_masks);
        }

        Ok(Self {
            input_ids,
            attention_masks,
            max_length,
        })
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of batches of `batch_size` examples, the last one possibly short
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Stack the examples at `indices` into a batch on `device`
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let rows = indices.len();
        let len = self.max_length;

        let mut ids = Vec::with_capacity(rows * len);
        let mut mask = Vec::with_capacity(rows * len);
        let mut span = 0;
        let mut target_tokens = 0;
        for &i in indices {
            ids.extend_from_slice(&self.input_ids[i]);
            mask.extend(self.attention_masks[i].iter().map(|&m| f32::from(m)));

            let real = self.attention_masks[i].iter().filter(|&&m| m == 1).count();
            span = span.max(real);
            target_tokens += real.saturating_sub(1);
        }

        let input_ids = Tensor::from_vec(ids, (rows, len), device)?;
        Ok(Batch {
            labels: input_ids.clone(),
            input_ids,
            attention_mask: Tensor::from_vec(mask, (rows, len), device)?,
            span,
            target_tokens,
        })
    }

    /// Batches following `order`
    pub fn batches<'a>(
        &'a self,
        order: &'a [usize],
        batch_size: usize,
        device: &'a Device,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        order
            .chunks(batch_size.max(1))
            .map(move |indices| self.batch(indices, device))
    }
}

impl Batch {
    pub fn size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_tokenizer;
    use pretty_assertions::assert_eq;

    fn corpus() -> TokenizedCorpus {
        let (_dir, tokenizer) = test_tokenizer();
        let texts = vec![
            "hello world".to_string(),
            "how are you".to_string(),
            "the mushroom is the forest".to_string(),
        ];
        TokenizedCorpus::build(&tokenizer, &texts, 5).unwrap()
    }

    #[test]
    fn test_build_pads_to_max_length() {
        let corpus = corpus();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.num_batches(2), 2);
        assert!(corpus.input_ids.iter().all(|ids| ids.len() == 5));
        assert_eq!(corpus.attention_masks[0], vec![1, 1, 1, 0, 0]);
        assert_eq!(corpus.attention_masks[2], vec![1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_batch_tensors() {
        let corpus = corpus();
        let batch = corpus.batch(&[0, 1], &Device::Cpu).unwrap();

        assert_eq!(batch.size(), 2);
        assert_eq!(batch.input_ids.dims(), &[2, 5]);
        assert_eq!(batch.span, 4);
        // 3 real tokens predict 2 targets, 4 predict 3
        assert_eq!(batch.target_tokens, 5);
        assert_eq!(
            batch.labels.to_vec2::<u32>().unwrap(),
            batch.input_ids.to_vec2::<u32>().unwrap()
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<f32>().unwrap()[0],
            vec![1.0, 1.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_batches_follow_order() {
        let corpus = corpus();
        let order = vec![2, 0, 1];
        let batches: Vec<Batch> = corpus
            .batches(&order, 2, &Device::Cpu)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].size(), 1);
        assert_eq!(batches[0].input_ids.to_vec2::<u32>().unwrap()[0][1], 10);
    }
}
