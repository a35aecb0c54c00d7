//! Join secrets shared by the server and its workers

use rand::Rng;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random string of ASCII letters
pub fn random_letters(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Cluster secret and token, generated once per create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSecrets {
    pub cluster_secret: String,
    pub token: String,
}

impl JoinSecrets {
    pub fn generate(len: usize) -> Self {
        Self {
            cluster_secret: random_letters(len),
            token: random_letters(len),
        }
    }

    /// Environment entries carrying both values
    pub fn env(&self) -> Vec<String> {
        vec![
            format!("K3S_CLUSTER_SECRET={}", self.cluster_secret),
            format!("K3S_TOKEN={}", self.token),
        ]
    }
}
