//! CLI command implementations.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use kryzbu_core::config::PUBLIC_KEY_FILE;
use kryzbu_core::crypto::{ServerPublicKey, SessionKey};
use kryzbu_core::{Client, ClientConfig, Credentials, Session};

const SETTINGS_FILE: &str = "settings.json";

/// Get password from user with secure input (masked).
fn get_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read password")
}

/// Locally persisted client state.
#[derive(Default, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Registered user name.
    pub username: Option<String>,
    /// Password used for LOGIN.
    pub password: Option<String>,
    /// Where downloads are written; the data directory's `downloads/` when unset.
    pub download_folder: Option<PathBuf>,
    /// Hex session key from the last LOGIN.
    pub session_key: Option<String>,
}

/// Data directory plus a client for the configured server.
pub struct App {
    data_dir: PathBuf,
    client: Client,
}

impl App {
    /// Create the data directory if needed.
    pub fn new(data_dir: PathBuf, server: SocketAddr) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            client: Client::new(ClientConfig::new(server)),
        })
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.data_dir.join(PUBLIC_KEY_FILE)
    }

    fn load_settings(&self) -> Result<ClientSettings> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(ClientSettings::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Corrupt settings file {}", path.display()))
    }

    fn save_settings(&self, settings: &ClientSettings) -> Result<()> {
        let path = self.settings_path();
        let text = serde_json::to_string_pretty(settings)?;
        std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;

        // Holds the password in the clear.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn credentials(settings: &ClientSettings) -> Result<Credentials> {
        match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => Ok(Credentials::new(username, password.as_str())),
            _ => bail!("No credentials saved. Run 'kryzbu register <username>' first."),
        }
    }

    /// Cached server key, fetched with GETKEY when missing.
    async fn server_key(&self) -> Result<ServerPublicKey> {
        let path = self.key_path();
        if path.exists() {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return ServerPublicKey::from_pem(&pem).context("Cached server key is invalid; run 'kryzbu flush-key'");
        }

        let fetched = self.client.get_key().await.context("Failed to fetch server key")?;
        if fetched.file_name != PUBLIC_KEY_FILE {
            debug!(announced = %fetched.file_name, "Server key saved under the local name");
        }
        std::fs::write(&path, &fetched.pem).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Server key cached");
        Ok(fetched.key)
    }

    async fn fresh_session_key(&self, settings: &mut ClientSettings) -> Result<SessionKey> {
        let credentials = Self::credentials(settings)?;
        let server_key = self.server_key().await?;
        let key = self
            .client
            .login(&server_key, &credentials)
            .await
            .context("Login failed")?;

        settings.session_key = Some(key.to_hex());
        self.save_settings(settings)?;
        Ok(key)
    }

    /// Cached session, logging in first when there is none.
    async fn session(&self) -> Result<Session> {
        let mut settings = self.load_settings()?;
        let credentials = Self::credentials(&settings)?;

        let key = match settings.session_key.as_deref().map(SessionKey::from_hex) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                warn!(error = %e, "Cached session key unreadable; logging in again");
                self.fresh_session_key(&mut settings).await?
            }
            None => self.fresh_session_key(&mut settings).await?,
        };
        Ok(Session::new(credentials.username, key))
    }

    fn download_folder(&self, settings: &ClientSettings) -> PathBuf {
        settings
            .download_folder
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    /// Upload each file, reporting failures individually.
    pub async fn upload(&self, files: &[PathBuf]) -> Result<()> {
        let session = self.session().await?;
        let mut failed = 0;
        for file in files {
            match self.client.upload(&session, file).await {
                Ok(bytes) => println!("Uploaded {} ({} bytes)", file.display(), bytes),
                Err(e) => {
                    failed += 1;
                    eprintln!("Failed to upload {}: {}", file.display(), e);
                }
            }
        }
        summarize(failed, files.len(), "upload")
    }

    /// Download each named file into the download folder.
    pub async fn download(&self, names: &[String]) -> Result<()> {
        let session = self.session().await?;
        let folder = self.download_folder(&self.load_settings()?);
        let mut failed = 0;
        for name in names {
            match self.client.download(&session, name, &folder).await {
                Ok(path) => println!("Downloaded {} to {}", name, path.display()),
                Err(e) => {
                    failed += 1;
                    eprintln!("Failed to download {}: {}", name, e);
                }
            }
        }
        summarize(failed, names.len(), "download")
    }

    /// Delete each named file.
    pub async fn remove(&self, names: &[String]) -> Result<()> {
        let session = self.session().await?;
        let mut failed = 0;
        for name in names {
            match self.client.remove(&session, name).await {
                Ok(()) => println!("Removed {}", name),
                Err(e) => {
                    failed += 1;
                    eprintln!("Failed to remove {}: {}", name, e);
                }
            }
        }
        summarize(failed, names.len(), "remove")
    }

    /// Print the caller's files.
    pub async fn list(&self) -> Result<()> {
        let session = self.session().await?;
        let files = self.client.list(&session).await.context("Failed to list files")?;
        if files.is_empty() {
            println!("No files stored.");
            return Ok(());
        }

        println!("{:<32} {:<10} {:>9}", "NAME", "UPLOADED", "DOWNLOADS");
        for file in files {
            println!("{:<32} {:<10} {:>9}", file.name, file.uploaded_display(), file.downloads);
        }
        Ok(())
    }

    /// Run LOGIN and replace the cached session key.
    pub async fn login(&self) -> Result<()> {
        let mut settings = self.load_settings()?;
        self.fresh_session_key(&mut settings).await?;
        println!("Logged in as {}.", settings.username.as_deref().unwrap_or_default());
        Ok(())
    }

    /// Save credentials. The account itself is created by the server operator.
    pub fn register(&self, username: &str) -> Result<()> {
        let password = get_password(&format!("Password for {}: ", username))?;
        if password.is_empty() {
            bail!("Password cannot be empty");
        }
        self.save_credentials(username, password)?;
        println!("Credentials for {} saved. Run 'kryzbu login' to verify them.", username);
        Ok(())
    }

    fn save_credentials(&self, username: &str, password: String) -> Result<()> {
        let mut settings = self.load_settings()?;
        settings.username = Some(username.to_string());
        settings.password = Some(password);
        settings.session_key = None;
        self.save_settings(&settings)
    }

    /// Drop the cached server key and session key.
    pub fn flush_key(&self) -> Result<()> {
        let path = self.key_path();
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        }

        let mut settings = self.load_settings()?;
        settings.session_key = None;
        self.save_settings(&settings)?;

        println!("Cached keys removed.");
        Ok(())
    }

    /// Set where downloads are written.
    pub fn set_download_folder(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;

        let mut settings = self.load_settings()?;
        settings.download_folder = Some(dir.clone());
        self.save_settings(&settings)?;

        println!("Downloads go to {}.", dir.display());
        Ok(())
    }
}

fn summarize(failed: usize, total: usize, action: &str) -> Result<()> {
    if failed > 0 {
        bail!("{} of {} {}s failed", failed, total, action);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(dir: &tempfile::TempDir) -> App {
        App::new(dir.path().join("client"), SocketAddr::from(([127, 0, 0, 1], 1))).expect("app")
    }

    #[test]
    fn test_settings_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = app(&dir).load_settings().expect("load");
        assert!(settings.username.is_none());
        assert!(settings.session_key.is_none());
    }

    #[test]
    fn test_save_credentials_clears_session_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(&dir);

        let mut settings = ClientSettings::default();
        settings.session_key = Some(SessionKey::generate().to_hex());
        app.save_settings(&settings).expect("save");

        app.save_credentials("alice", "pw1".into()).expect("credentials");
        let settings = app.load_settings().expect("load");
        assert_eq!(settings.username.as_deref(), Some("alice"));
        assert_eq!(settings.password.as_deref(), Some("pw1"));
        assert!(settings.session_key.is_none());
    }

    #[test]
    fn test_flush_key_and_download_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(&dir);

        std::fs::write(app.key_path(), "pem").expect("write key");
        let mut settings = ClientSettings::default();
        settings.session_key = Some(SessionKey::generate().to_hex());
        app.save_settings(&settings).expect("save");

        app.flush_key().expect("flush");
        assert!(!app.key_path().exists());
        assert!(app.load_settings().expect("load").session_key.is_none());

        let target = dir.path().join("dl");
        app.set_download_folder(&target).expect("set folder");
        let settings = app.load_settings().expect("load");
        assert_eq!(app.download_folder(&settings), target.canonicalize().expect("canonical"));
    }

    #[test]
    fn test_missing_credentials() {
        assert!(App::credentials(&ClientSettings::default()).is_err());
    }
}
