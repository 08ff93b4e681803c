//! Model module: device selection, checkpoint loading, tokenization and
//! text generation on top of candle's Llama implementation.

mod device;
mod loader;
mod runtime;
mod tokenizer;

pub use device::{select_device, select_dtype};
pub use loader::{
    eos_token_ids, load_for_inference, load_trainable, load_weights, read_llama_config,
    save_pretrained, weight_files, LoadedModel, TrainableModel, CONFIG_FILE, WEIGHTS_FILE,
    WEIGHTS_INDEX_FILE,
};
pub use runtime::ModelRuntime;
pub use tokenizer::{PaddedBatch, SpecialTokens, TextTokenizer, TOKENIZER_FILE};

#[cfg(test)]
pub(crate) use loader::tests::write_tiny_checkpoint;
#[cfg(test)]
pub(crate) use tokenizer::tests::{test_tokenizer, write_tokenizer};
