mod mock;

use std::path::PathBuf;

use rand::Rng;
use rand::distr::Alphanumeric;

pub use mock::{MockRequest, MockServer};

pub fn trace_init() {
    let levels = std::env::var("TEST_LOG").unwrap_or_else(|_| "warn".into());

    // another test might have installed the subscriber already
    let _ = crate::trace::init(false, &levels);
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
}

pub fn temp_file() -> PathBuf {
    std::env::temp_dir().join(random_string(16))
}

pub fn temp_dir() -> PathBuf {
    let path = temp_file();
    std::fs::create_dir_all(&path).unwrap();
    path
}
