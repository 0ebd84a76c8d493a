use rand::distributions::Alphanumeric;
use rand::Rng;

const UFRAG_LEN: usize = 4;
const PWD_LEN: usize = 22;

fn random_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// generate_ufrag returns a fresh ice-ufrag (RFC 5245 minimums).
pub fn generate_ufrag() -> String {
    random_string(UFRAG_LEN)
}

/// generate_pwd returns a fresh ice-pwd.
pub fn generate_pwd() -> String {
    random_string(PWD_LEN)
}
