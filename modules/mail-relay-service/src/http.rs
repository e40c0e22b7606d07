use once_cell::sync::OnceCell;
use reqwest::Client;
use std::time::Duration;

/// Process-wide HTTP client shared by every upstream collaborator.
///
/// `Client::clone()` is just an `Arc` increment. The per-request timeout is
/// fixed by the first `init_shared_client` call.
static SHARED_CLIENT: OnceCell<Client> = OnceCell::new();

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .build()
        .expect("Failed to create shared HTTP client")
}

/// Initialise the shared client with the configured timeout
pub fn init_shared_client(timeout: Duration) -> &'static Client {
    SHARED_CLIENT.get_or_init(|| build_client(timeout))
}

/// Cap upstream error bodies before they reach the log
pub fn truncate_error(s: &str) -> &str {
    if s.len() <= 200 {
        return s;
    }
    let mut end = 200;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(150);
        let cut = truncate_error(&long);
        assert!(cut.len() <= 200);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_shared_client_is_singleton() {
        let a = init_shared_client(Duration::from_secs(30)) as *const Client;
        let b = init_shared_client(Duration::from_secs(5)) as *const Client;
        assert_eq!(a, b);
    }
}
