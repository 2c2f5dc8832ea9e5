//! Go/no-go gate
//!
//! An operator-supplied program run before each check-in. The run proceeds
//! only if it exits zero, e.g. `check_load -c 1,5,15` to skip backups on a
//! busy host.

use std::process::Stdio;

use tokio::process::Command;

/// Run the go/no-go program. An empty program always says go.
pub async fn should_go(program: &[String]) -> bool {
    let Some((name, args)) = program.split_first() else {
        return true;
    };

    tracing::debug!("Executing go/no-go: {:?}", program);
    let status = Command::new(name)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::debug!("Go/no-go exited {}, skipping this run", status);
            false
        }
        Err(e) => {
            tracing::debug!("Go/no-go could not run ({}), skipping this run", e);
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_program_goes() {
        assert!(should_go(&[]).await);
    }

    #[tokio::test]
    async fn test_exit_status_decides() {
        assert!(should_go(&argv(&["true"])).await);
        assert!(!should_go(&argv(&["false"])).await);
        assert!(should_go(&argv(&["sh", "-c", "exit 0"])).await);
        assert!(!should_go(&argv(&["sh", "-c", "exit 3"])).await);
    }

    #[tokio::test]
    async fn test_missing_program_is_no_go() {
        assert!(!should_go(&argv(&["/nonexistent/ferry-gonogo"])).await);
    }
}
