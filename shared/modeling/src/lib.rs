mod averager;
mod codec;
mod compress;
mod container;
mod evaluator;
mod schedule;

pub use averager::{aggregate_deltas, apply_deltas};
pub use codec::{CodecError, TensorMap, decode_gradients, encode_gradients};
pub use compress::{COMPRESSION_MAGIC, compress_gradients, decompress_gradients};
pub use container::{
    ContainerError, ModelContainer, build_initial_container, extract_weights, inject_weights,
    set_learning_rate,
};
pub use evaluator::{EvalDataset, EvalError, Evaluator};
pub use schedule::cosine_decay_learning_rate;
