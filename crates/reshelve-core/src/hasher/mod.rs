mod xxhash;

pub use xxhash::{files_identical, hash_data, hash_str};
