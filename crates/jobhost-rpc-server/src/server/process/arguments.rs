//! Launch description of a worker process.

use super::sanitize::sanitize;
use std::path::PathBuf;

/// Executable and argument lists of one worker description. Built once per
/// description and reused for every process launched from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerProcessArguments {
    pub executable_path: PathBuf,
    /// Arguments passed to the executable itself, before the worker path.
    pub executable_arguments: Vec<String>,
    /// Entry point handed to the executable (a script or assembly). `None`
    /// when the executable is the worker.
    pub worker_path: Option<PathBuf>,
    /// Arguments for the worker, after the worker path.
    pub worker_arguments: Vec<String>,
}

/// Everything needed to launch one worker process and let it dial back.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub request_id: String,
    pub arguments: WorkerProcessArguments,
    pub working_directory: PathBuf,
    /// Host name or address the worker connects to.
    pub server_host: String,
    pub server_port: u16,
    pub max_message_length: usize,
    pub environment: Vec<(String, String)>,
}

impl WorkerContext {
    /// Full argument vector: executable args, worker path, worker args, then
    /// the host-assigned connection arguments.
    pub fn command_args(&self) -> Vec<String> {
        let args = &self.arguments;
        let mut out = args.executable_arguments.clone();
        if let Some(path) = &args.worker_path {
            out.push(path.display().to_string());
        }
        out.extend(args.worker_arguments.iter().cloned());
        out.extend([
            "--host".to_owned(),
            self.server_host.clone(),
            "--port".to_owned(),
            self.server_port.to_string(),
            "--workerId".to_owned(),
            self.worker_id.clone(),
            "--requestId".to_owned(),
            self.request_id.clone(),
            "--grpcMaxMessageLength".to_owned(),
            self.max_message_length.to_string(),
        ]);
        out
    }

    /// Environment overrides for the process, host-assigned entries last.
    pub fn command_env(&self) -> Vec<(String, String)> {
        let mut env = self.environment.clone();
        env.push(("FUNCTIONS_WORKER_ID".to_owned(), self.worker_id.clone()));
        env.push(("FUNCTIONS_GRPC_PORT".to_owned(), self.server_port.to_string()));
        env
    }

    /// Command line safe for logs.
    pub fn display_command(&self) -> String {
        let mut line = self.arguments.executable_path.display().to_string();
        for arg in self.command_args() {
            line.push(' ');
            line.push_str(&arg);
        }
        sanitize(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkerContext {
        WorkerContext {
            worker_id: "w-1".into(),
            request_id: "r-1".into(),
            arguments: WorkerProcessArguments {
                executable_path: "/usr/bin/node".into(),
                executable_arguments: vec!["--inspect=0".into()],
                worker_path: Some("/workers/node/worker.js".into()),
                worker_arguments: vec![
                    "--conn".into(),
                    "AccountName=a;AccountKey=abcde==".into(),
                ],
            },
            working_directory: "/workers/node".into(),
            server_host: "127.0.0.1".into(),
            server_port: 5005,
            max_message_length: 1024,
            environment: vec![("LANG".into(), "C".into())],
        }
    }

    #[test]
    fn host_arguments_follow_worker_arguments() {
        let args = context().command_args();
        assert_eq!(
            args,
            [
                "--inspect=0",
                "/workers/node/worker.js",
                "--conn",
                "AccountName=a;AccountKey=abcde==",
                "--host",
                "127.0.0.1",
                "--port",
                "5005",
                "--workerId",
                "w-1",
                "--requestId",
                "r-1",
                "--grpcMaxMessageLength",
                "1024",
            ]
        );
    }

    #[test]
    fn environment_carries_worker_identity() {
        let env = context().command_env();
        assert!(env.contains(&("LANG".into(), "C".into())));
        assert!(env.contains(&("FUNCTIONS_WORKER_ID".into(), "w-1".into())));
        assert!(env.contains(&("FUNCTIONS_GRPC_PORT".into(), "5005".into())));
    }

    #[test]
    fn logged_command_hides_secrets() {
        let line = context().display_command();
        assert!(!line.contains("abcde=="), "{line}");
        assert!(line.starts_with("/usr/bin/node --inspect=0 /workers/node/worker.js"));
        assert!(line.contains("AccountName=a"));
    }
}
