/*
 * Test utilities for helmgate
 *
 * Isolated device configurations and a scripted transport shared by the
 * command tests.
 */

#[cfg(test)]
pub mod test_utils {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;

    use hg_core::{DeviceConfig, HttpResponse, Result, Transport, UploadForm};
    use tempfile::TempDir;

    /// Card table seeded by [`create_test_config`]
    pub const SEEDED_CARDS: &str = "site_code,user_code,nombre,enabled\n148,19828,Ana,1\n";

    /// Configuration whose storage lives entirely under `dir`
    pub fn create_test_config(dir: &TempDir) -> DeviceConfig {
        let mut config = DeviceConfig {
            data_dir: dir.path().join("data"),
            media_dir: dir.path().join("media"),
            state_dir: dir.path().join("config"),
            ..DeviceConfig::default()
        };
        config.server.function_url = Some("https://edge.example/upload".into());
        config.server.cards_url = Some("https://edge.example/cards-manifest".into());
        config.server.edge_api_key = Some("test-key".into());
        config.ensure_dirs().unwrap();
        fs::write(config.cards_csv(), SEEDED_CARDS).unwrap();
        config
    }

    /// Transport answering from a queue and recording every request
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: RefCell<VecDeque<HttpResponse>>,
        pub gets: RefCell<Vec<(String, bool)>>,
        pub uploads: RefCell<Vec<UploadForm>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, status: u16, body: impl Into<Vec<u8>>) -> Self {
            self.replies.borrow_mut().push_back(HttpResponse { status, body: body.into() });
            self
        }

        fn next(&self) -> Result<HttpResponse> {
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| hg_core::HelmgateError::transport("no scripted reply left"))
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, url: &str, authenticated: bool) -> Result<HttpResponse> {
            self.gets.borrow_mut().push((url.to_string(), authenticated));
            self.next()
        }

        fn post_upload(&self, _url: &str, form: &UploadForm) -> Result<HttpResponse> {
            self.uploads.borrow_mut().push(form.clone());
            self.next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use hg_core::Transport;
    use tempfile::TempDir;

    #[test]
    fn test_config_is_isolated() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        assert!(config.data_dir.starts_with(dir.path()));
        assert!(config.cards_csv().exists());
    }

    #[test]
    fn test_scripted_transport_runs_dry() {
        let t = ScriptedTransport::new().reply(200, "{}");
        assert_eq!(t.get("u", true).unwrap().status, 200);
        assert!(t.get("u", false).is_err());
        assert_eq!(t.gets.borrow().len(), 2);
    }
}
