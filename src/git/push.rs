//! Remote push for GitWorkspace
//!
//! Pushes task branches to origin before a pull request is opened.

use git2::Error as GitError;

use crate::git::GitWorkspace;

impl GitWorkspace {
    /// Push a branch to the remote repository. With a token the push
    /// authenticates over HTTPS; without one it falls back to the SSH agent.
    pub fn push_branch(
        &self,
        branch_name: &str,
        token: Option<&str>,
        force: bool,
    ) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote("origin")?;

        let refspec = if force {
            format!("+refs/heads/{}:refs/heads/{}", branch_name, branch_name)
        } else {
            format!("refs/heads/{}:refs/heads/{}", branch_name, branch_name)
        };

        let token = token.map(|t| t.to_string());
        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, _allowed_types| {
            match token.as_deref() {
                Some(token) => git2::Cred::userpass_plaintext("x-access-token", token),
                None => git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git")),
            }
        });

        let mut push_options = git2::PushOptions::new();
        push_options.remote_callbacks(callbacks);

        remote.push(&[&refspec], Some(&mut push_options))?;

        log::info!("[Git] Pushed branch {} to origin", branch_name);
        Ok(())
    }
}
