use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubectl {verb} failed with exit code {code}")]
    Exit {
        verb: Verb,
        code: i32,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Apply,
    Get,
    Delete,
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verb::Create => "create",
            Verb::Apply => "apply",
            Verb::Get => "get",
            Verb::Delete => "delete",
        })
    }
}

pub const CONFIG_MAP: &str = "configmap";

/// One kubectl command line.
///
/// Renders as `<verb> [kind] [names...] [--from-file=...] [-f ...] [-n ns] [-o fmt] [--save-config]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub verb: Verb,
    pub kind: Option<String>,
    pub names: Vec<String>,
    pub from_files: Vec<String>,
    pub files: Vec<PathBuf>,
    pub namespace: Option<String>,
    pub output: Option<String>,
    pub save_config: bool,
}

impl Invocation {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            kind: None,
            names: vec![],
            from_files: vec![],
            files: vec![],
            namespace: None,
            output: None,
            save_config: false,
        }
    }

    pub fn create(kind: &str, name: &str) -> Self {
        Self::new(Verb::Create).kind(kind).name(name)
    }

    pub fn get(kind: &str) -> Self {
        Self::new(Verb::Get).kind(kind)
    }

    pub fn delete(kind: &str, names: &[String]) -> Self {
        let mut invocation = Self::new(Verb::Delete).kind(kind);
        invocation.names.extend(names.iter().cloned());
        invocation
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.names.push(name.to_string());
        self
    }

    /// `--from-file` source, either `path` or `key=path`.
    pub fn from_file(mut self, source: impl Into<String>) -> Self {
        self.from_files.push(source.into());
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    pub fn output(mut self, format: &str) -> Self {
        self.output = Some(format.to_string());
        self
    }

    pub fn save_config(mut self, save_config: bool) -> Self {
        self.save_config = save_config;
        self
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![self.verb.to_string().into()];
        if let Some(kind) = &self.kind {
            args.push(kind.into());
        }
        args.extend(self.names.iter().map(OsString::from));
        for source in &self.from_files {
            args.push(format!("--from-file={source}").into());
        }
        for file in &self.files {
            args.push("-f".into());
            args.push(file.into());
        }
        if let Some(namespace) = &self.namespace {
            args.push("-n".into());
            args.push(namespace.into());
        }
        if let Some(output) = &self.output {
            args.push("-o".into());
            args.push(output.into());
        }
        if self.save_config {
            args.push("--save-config".into());
        }
        args
    }
}

/// Everything that touches the cluster goes through here.
pub trait Cluster {
    /// Run a command that only has side effects. Output is mirrored to the terminal.
    fn run(&self, invocation: &Invocation) -> Result<(), Error>;

    /// Run a command and capture its standard output. Errors are mirrored to the terminal.
    fn output(&self, invocation: &Invocation) -> Result<String, Error>;

    /// Run a command silently and report whether it succeeded.
    fn probe(&self, invocation: &Invocation) -> bool;

    /// `kubectl apply -f -` with the document on standard input.
    fn apply_stdin(&self, document: &str) -> Result<(), Error>;
}

pub struct Kubectl {
    binary: String,
}

impl Kubectl {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn command(&self, invocation: &Invocation) -> std::process::Command {
        debug!("{} {:?}", self.binary, invocation.args());
        let mut command = std::process::Command::new(&self.binary);
        command.args(invocation.args());
        command
    }
}

fn check(verb: Verb, exit_status: ExitStatus) -> Result<(), Error> {
    if exit_status.success() {
        Ok(())
    } else {
        Err(Error::Exit {
            verb,
            code: exit_status.code().unwrap_or(-1),
        })
    }
}

impl Cluster for Kubectl {
    fn run(&self, invocation: &Invocation) -> Result<(), Error> {
        self.command(invocation)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map(|exit_status| check(invocation.verb, exit_status))?
    }

    fn output(&self, invocation: &Invocation) -> Result<String, Error> {
        let output = self.command(invocation)
            .stderr(Stdio::inherit())
            .output()?;
        check(invocation.verb, output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn probe(&self, invocation: &Invocation) -> bool {
        self.command(invocation)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|exit_status| exit_status.success())
            .unwrap_or(false)
    }

    fn apply_stdin(&self, document: &str) -> Result<(), Error> {
        let invocation = Invocation::new(Verb::Apply).file("-");
        let mut child = self.command(&invocation)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        // stdin is dropped before waiting so kubectl sees end of input.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(document.as_bytes()),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "kubectl stdin unavailable")),
        };
        check(Verb::Apply, child.wait()?)?;
        Ok(written?)
    }
}

/// In-memory cluster used by tests across the crate.
#[cfg(test)]
pub mod fake {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::Path;
    use serde::Deserialize;
    use serde_yaml::Value;
    use super::{Cluster, Error, Invocation, Verb, CONFIG_MAP};

    /// Objects are keyed by `(namespace, name)`.
    pub type Key = (String, String);

    #[derive(Default, Debug, Clone, PartialEq)]
    pub struct State {
        pub config_maps: BTreeMap<Key, BTreeMap<String, String>>,
        pub secrets: BTreeMap<Key, Value>,
        pub resources: BTreeMap<Key, Value>,
        pub history: Vec<Invocation>,
        pub stdin_documents: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeCluster {
        pub state: RefCell<State>,
        failures: RefCell<Vec<Box<dyn Fn(&Invocation) -> bool>>>,
    }

    pub fn key(namespace: Option<&str>, name: &str) -> Key {
        (namespace.unwrap_or("default").to_string(), name.to_string())
    }

    fn failed(verb: Verb) -> Error {
        Error::Exit { verb, code: 1 }
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every later invocation matching `predicate` exits non-zero.
        pub fn fail_when(&self, predicate: impl Fn(&Invocation) -> bool + 'static) {
            self.failures.borrow_mut().push(Box::new(predicate));
        }

        pub fn config_map_names(&self) -> Vec<Key> {
            self.state.borrow().config_maps.keys().cloned().collect()
        }

        pub fn resource(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
            self.state.borrow().resources.get(&key(namespace, name)).cloned()
        }

        pub fn secret(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
            self.state.borrow().secrets.get(&key(namespace, name)).cloned()
        }

        pub fn history(&self) -> Vec<Invocation> {
            self.state.borrow().history.clone()
        }

        fn enter(&self, invocation: &Invocation) -> Result<(), Error> {
            self.state.borrow_mut().history.push(invocation.clone());
            if self.failures.borrow().iter().any(|fails| fails(invocation)) {
                return Err(failed(invocation.verb));
            }
            Ok(())
        }

        fn store_document(&self, document: &Value, namespace: Option<&str>, verb: Verb) -> Result<(), Error> {
            let name = document["metadata"]["name"].as_str().unwrap_or_default();
            let namespace = namespace.or(document["metadata"]["namespace"].as_str());
            let key = key(namespace, name);
            let mut state = self.state.borrow_mut();
            match document["kind"].as_str().unwrap_or_default() {
                "ConfigMap" => {
                    let data = document["data"]
                        .as_mapping()
                        .map(|mapping| {
                            mapping
                                .iter()
                                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                                .collect()
                        })
                        .unwrap_or_default();
                    state.config_maps.insert(key, data);
                }
                "Secret" => {
                    state.secrets.insert(key, document.clone());
                }
                _ => {
                    if verb == Verb::Create && state.resources.contains_key(&key) {
                        return Err(failed(verb));
                    }
                    state.resources.insert(key, document.clone());
                }
            }
            Ok(())
        }

        fn store_file(&self, path: &Path, namespace: Option<&str>, verb: Verb) -> Result<(), Error> {
            if path.is_dir() {
                for entry in std::fs::read_dir(path)? {
                    self.store_file(&entry?.path(), namespace, verb)?;
                }
                return Ok(());
            }
            let contents = std::fs::read_to_string(path)?;
            for document in serde_yaml::Deserializer::from_str(&contents) {
                let document = Value::deserialize(document).map_err(|_| failed(verb))?;
                self.store_document(&document, namespace, verb)?;
            }
            Ok(())
        }

        fn create_config_map(&self, invocation: &Invocation) -> Result<(), Error> {
            let name = invocation.names.first().cloned().unwrap_or_default();
            let key = key(invocation.namespace.as_deref(), &name);
            if self.state.borrow().config_maps.contains_key(&key) {
                return Err(failed(invocation.verb));
            }
            let mut data = BTreeMap::new();
            for source in &invocation.from_files {
                let (file_key, path) = match source.split_once('=') {
                    Some((file_key, path)) => (Some(file_key.to_string()), Path::new(path).to_path_buf()),
                    None => (None, Path::new(source).to_path_buf()),
                };
                let paths = if path.is_dir() {
                    std::fs::read_dir(&path)?
                        .map(|entry| entry.map(|entry| entry.path()))
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    vec![path]
                };
                for path in paths {
                    let contents = std::fs::read_to_string(&path)?;
                    let file_name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
                    data.insert(file_key.clone().unwrap_or(file_name), contents);
                }
            }
            self.state.borrow_mut().config_maps.insert(key, data);
            Ok(())
        }

        fn delete(&self, invocation: &Invocation) -> Result<(), Error> {
            let mut missing = false;
            let mut state = self.state.borrow_mut();
            for name in &invocation.names {
                let key = key(invocation.namespace.as_deref(), name);
                let removed = match invocation.kind.as_deref() {
                    Some(CONFIG_MAP) | Some("cm") => state.config_maps.remove(&key).is_some(),
                    Some("secret") => state.secrets.remove(&key).is_some(),
                    _ => state.resources.remove(&key).is_some(),
                };
                if invocation.kind.as_deref() == Some("namespace") {
                    state.config_maps.retain(|(namespace, _), _| namespace != name);
                    state.secrets.retain(|(namespace, _), _| namespace != name);
                    state.resources.retain(|(namespace, _), _| namespace != name);
                }
                missing |= !removed;
            }
            if missing {
                Err(failed(invocation.verb))
            } else {
                Ok(())
            }
        }
    }

    impl Cluster for FakeCluster {
        fn run(&self, invocation: &Invocation) -> Result<(), Error> {
            self.enter(invocation)?;
            match (invocation.verb, invocation.kind.as_deref()) {
                (Verb::Create, Some(CONFIG_MAP)) => self.create_config_map(invocation),
                (Verb::Create | Verb::Apply, None) => {
                    for file in &invocation.files {
                        self.store_file(file, invocation.namespace.as_deref(), invocation.verb)?;
                    }
                    Ok(())
                }
                (Verb::Delete, _) => self.delete(invocation),
                _ => Ok(()),
            }
        }

        fn output(&self, invocation: &Invocation) -> Result<String, Error> {
            self.enter(invocation)?;
            let Some(name) = invocation.names.first() else {
                return Ok(String::new());
            };
            let resource = self
                .resource(invocation.namespace.as_deref(), name)
                .ok_or(failed(invocation.verb))?;
            serde_json::to_string(&resource).map_err(|_| failed(invocation.verb))
        }

        fn probe(&self, invocation: &Invocation) -> bool {
            self.enter(invocation).is_ok()
        }

        fn apply_stdin(&self, document: &str) -> Result<(), Error> {
            self.enter(&Invocation::new(Verb::Apply).file("-"))?;
            self.state.borrow_mut().stdin_documents.push(document.to_string());
            let document: Value = serde_yaml::from_str(document).map_err(|_| failed(Verb::Apply))?;
            self.store_document(&document, None, Verb::Apply)
        }
    }
}
