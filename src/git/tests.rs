//! Tests for GitWorkspace
//!
//! Contains unit tests for branch, worktree, commit, and merge operations

#[cfg(test)]
mod tests {
    use crate::git::GitWorkspace;
    use git2::{Repository, Signature};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, GitWorkspace) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path();

        // Initialize a git repository
        let repo = Repository::init(repo_path).unwrap();

        // Create initial commit
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();

            let test_file = repo_path.join("test.txt");
            fs::write(&test_file, "Hello, World!").unwrap();
            index.add_path(Path::new("test.txt")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };

        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        let workspace = GitWorkspace::open(repo_path).unwrap();
        (temp_dir, workspace)
    }

    fn commit_file(
        workspace: &GitWorkspace,
        dir: &Path,
        name: &str,
        content: &str,
        message: &str,
    ) -> String {
        fs::write(dir.join(name), content).unwrap();
        workspace.stage_all().unwrap();
        workspace
            .create_commit(message, "Test User", "test@example.com")
            .unwrap()
            .id
    }

    #[test]
    fn test_open_workspace() {
        let (_temp_dir, workspace) = setup_test_repo();
        assert!(workspace.repo_path().exists());
        assert!(workspace.workdir().is_some());
    }

    #[test]
    fn test_create_branch_from_head() {
        let (_temp_dir, workspace) = setup_test_repo();

        let branch = workspace.create_branch("feature-test", None, false).unwrap();
        assert_eq!(branch.name, "feature-test");
        assert!(!branch.is_head);
        assert!(workspace.branch_exists("feature-test"));
    }

    #[test]
    fn test_create_branch_from_base() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();

        workspace.create_branch("base-point", None, false).unwrap();
        let base_head = workspace.branch_head("base-point").unwrap();

        // Advance the default branch past the base point
        commit_file(&workspace, temp_dir.path(), "more.txt", "more", "Add more");

        let branch = workspace
            .create_branch("from-base", Some("base-point"), false)
            .unwrap();
        assert_eq!(branch.commit_id, base_head);
        assert_ne!(branch.commit_id, workspace.branch_head(&default).unwrap());
    }

    #[test]
    fn test_create_branch_force_resets() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();

        workspace.create_branch("resettable", None, false).unwrap();
        workspace.checkout_branch("resettable").unwrap();
        commit_file(&workspace, temp_dir.path(), "wip.txt", "wip", "Work in progress");
        workspace.checkout_branch(&default).unwrap();

        let branch = workspace
            .create_branch("resettable", Some(&default), true)
            .unwrap();
        assert_eq!(branch.commit_id, workspace.branch_head(&default).unwrap());
    }

    #[test]
    fn test_unborn_repo_gets_initial_commit() {
        let temp_dir = TempDir::new().unwrap();
        Repository::init(temp_dir.path()).unwrap();

        let workspace = GitWorkspace::open(temp_dir.path()).unwrap();
        let branch = workspace.create_branch("first", None, false).unwrap();

        assert_eq!(branch.name, "first");
        assert!(!branch.commit_id.is_empty());
    }

    #[test]
    fn test_delete_branch() {
        let (_temp_dir, workspace) = setup_test_repo();

        workspace.create_branch("to-delete", None, false).unwrap();
        assert!(workspace.branch_exists("to-delete"));

        workspace.delete_branch("to-delete").unwrap();
        assert!(!workspace.branch_exists("to-delete"));
    }

    #[test]
    fn test_create_worktree_sanitizes_name() {
        let (temp_dir, workspace) = setup_test_repo();

        let worktree_path = temp_dir.path().join("wt-task");
        let worktree = workspace
            .create_worktree("task/abc-123", worktree_path.to_str().unwrap(), None)
            .unwrap();

        // "/" in the branch name must not create nested .git/worktrees dirs
        assert_eq!(worktree.name, "task-abc-123");
        assert!(Path::new(&worktree.path).exists());
        assert_eq!(worktree.branch.as_deref(), Some("task/abc-123"));
    }

    #[test]
    fn test_remove_worktree_by_path() {
        let (temp_dir, workspace) = setup_test_repo();

        let worktree_path = temp_dir.path().join("wt-remove");
        let worktree = workspace
            .create_worktree("task/remove-me", worktree_path.to_str().unwrap(), None)
            .unwrap();
        assert!(Path::new(&worktree.path).exists());

        workspace.remove_worktree(&worktree.path).unwrap();
        assert!(!Path::new(&worktree.path).exists());

        let names: Vec<String> = workspace
            .list_worktrees()
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert!(!names.contains(&"task-remove-me".to_string()));
    }

    #[test]
    fn test_remove_worktree_unknown_path_errors() {
        let (_temp_dir, workspace) = setup_test_repo();
        assert!(workspace.remove_worktree("/nonexistent/worktree").is_err());
    }

    #[test]
    fn test_prune_orphaned_worktrees() {
        let (temp_dir, workspace) = setup_test_repo();

        let worktree_path = temp_dir.path().join("wt-orphan");
        workspace
            .create_worktree("task/orphan", worktree_path.to_str().unwrap(), None)
            .unwrap();

        // Simulate the directory vanishing out from under us
        fs::remove_dir_all(&worktree_path).unwrap();

        let pruned = workspace.prune_orphaned_worktrees().unwrap();
        assert_eq!(pruned, 1);
    }

    #[test]
    fn test_commits_in_range() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();
        let base = workspace.branch_head(&default).unwrap();

        workspace.create_branch("feat", None, false).unwrap();
        workspace.checkout_branch("feat").unwrap();
        commit_file(&workspace, temp_dir.path(), "feat.txt", "feature", "Add feature");

        let delta = workspace.commits_in_range(Some(&base), "feat").unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].message, "Add feature");

        let full = workspace.commits_in_range(None, "feat").unwrap();
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn test_merge_fast_forward() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();

        workspace.create_branch("feat-ff", None, false).unwrap();
        workspace.checkout_branch("feat-ff").unwrap();
        commit_file(&workspace, temp_dir.path(), "ff.txt", "ff", "Fast-forwardable");

        let result = workspace.merge_branch("feat-ff", &default).unwrap();
        assert!(result.success);
        assert!(result.fast_forward);
        assert!(result.conflict_files.is_empty());
    }

    #[test]
    fn test_merge_creates_merge_commit_on_divergence() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();

        workspace.create_branch("feat-diverged", None, false).unwrap();

        // Advance both sides with unrelated files
        commit_file(&workspace, temp_dir.path(), "main.txt", "main", "Main side");
        workspace.checkout_branch("feat-diverged").unwrap();
        commit_file(&workspace, temp_dir.path(), "feat.txt", "feat", "Feature side");

        let result = workspace.merge_branch("feat-diverged", &default).unwrap();
        assert!(result.success);
        assert!(!result.fast_forward);
        assert!(result.commit_id.is_some());
    }

    #[test]
    fn test_merge_conflict_reported_and_aborted() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();

        workspace.create_branch("feat-conflict", None, false).unwrap();

        // Both sides edit the same file
        commit_file(&workspace, temp_dir.path(), "test.txt", "Default change", "Default edit");
        workspace.checkout_branch("feat-conflict").unwrap();
        commit_file(&workspace, temp_dir.path(), "test.txt", "Feature change", "Feature edit");

        let result = workspace.merge_branch("feat-conflict", &default).unwrap();
        assert!(!result.success);
        assert_eq!(result.conflict_files, vec!["test.txt".to_string()]);

        workspace.merge_abort().unwrap();
        // Merge state is gone and the workspace is usable again
        assert!(workspace.branch_head(&default).is_ok());
    }

    #[test]
    fn test_default_branch_name() {
        let (_temp_dir, workspace) = setup_test_repo();
        let name = workspace.default_branch_name();
        assert!(name == "main" || name == "master");
    }

    #[test]
    fn test_commit_info_fields() {
        let (temp_dir, workspace) = setup_test_repo();
        let default = workspace.default_branch_name();
        commit_file(&workspace, temp_dir.path(), "x.txt", "x", "Add x");

        let commits = workspace.commits_in_range(None, &default).unwrap();
        let commit = &commits[0];

        assert!(!commit.id.is_empty());
        assert_eq!(commit.short_id.len(), 7);
        assert_eq!(commit.author, "Test User");
        assert_eq!(commit.email, "test@example.com");
        assert!(commit.timestamp > 0);
        assert_eq!(commit.message, "Add x");
    }
}
