//! Upstart job definitions for the services a deployment runs

use serde::{Deserialize, Serialize};

use crate::core::errors::{BearError, Result};
use crate::deploy::shell;

const GROUP_COMMANDS: [&str; 4] = ["start", "stop", "status", "restart"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstartService {
    pub name: String,
    pub description: String,
    /// Working directory of the job
    #[serde(default)]
    pub dir: Option<String>,
    /// Body of the job's `script` block
    pub script: String,
    /// Environment exported to the script, in declaration order
    #[serde(default)]
    pub exports: Vec<(String, String)>,
}

impl UpstartService {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            dir: None,
            script: script.into(),
            exports: Vec::new(),
        }
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn export(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exports.push((key.into(), value.into()));
        self
    }

    pub fn conf_path(&self) -> String {
        format!("/etc/init/{}.conf", self.name)
    }
}

/// Services installed together, optionally controlled as a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstartServices {
    #[serde(default)]
    pub group_name: Option<String>,
    pub services: Vec<UpstartService>,
}

impl UpstartServices {
    pub fn new(group_name: Option<String>) -> Self {
        Self {
            group_name,
            services: Vec::new(),
        }
    }

    pub fn add(mut self, service: UpstartService) -> Self {
        self.services.push(service);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runlevels {
    pub start_on: String,
    pub stop_on: String,
}

impl Default for Runlevels {
    fn default() -> Self {
        Self {
            start_on: "2345".to_string(),
            stop_on: "016".to_string(),
        }
    }
}

/// The `/etc/init/<name>.conf` job file for `service`
pub fn render_conf(service: &UpstartService, runlevels: &Runlevels) -> String {
    let mut text = String::new();
    text.push_str("#!upstart\n");
    text.push_str(&format!("description {}\n", double_quote(&service.description)));
    text.push_str("author      \"bear\"\n");
    if let Some(dir) = &service.dir {
        text.push_str(&format!("chdir {}\n", shell::quote(dir)));
    }
    text.push('\n');
    text.push_str(&format!("start on runlevel [{}]\n", runlevels.start_on));
    text.push_str(&format!("stop on runlevel [{}]\n", runlevels.stop_on));
    text.push('\n');

    text.push_str("# exports\n");
    for (key, value) in &service.exports {
        text.push_str(&format!("env {}={}\n", key, shell::quote(value)));
    }
    for (key, _) in &service.exports {
        text.push_str(&format!("export {}\n", key));
    }
    text.push('\n');

    text.push_str("respawn\n");
    text.push_str("respawn limit 5 60\n");
    text.push('\n');
    text.push_str("script\n");
    for line in service.script.lines() {
        text.push_str(&format!("    {}\n", line));
    }
    text.push_str("end script\n");
    text
}

fn double_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push(' '),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Body of `/usr/bin/<group>_<command>`
pub fn render_group_script(services: &UpstartServices, command: &str) -> String {
    let mut text = String::from("#!/bin/sh\n");
    for service in &services.services {
        text.push_str(&format!("sudo service {} {}\n", service.name, command));
    }
    text
}

/// Commands that write every job file and, for a named group, the group
/// control scripts
pub fn install_commands(services: &UpstartServices, runlevels: &Runlevels) -> Result<Vec<String>> {
    if services.services.is_empty() {
        return Err(BearError::validation("no upstart services to install"));
    }

    let mut commands = Vec::new();
    for service in &services.services {
        if service.name.is_empty() || service.name.contains('/') {
            return Err(BearError::validation_field(
                format!("invalid upstart service name '{}'", service.name),
                "name",
            ));
        }
        if let Some((key, _)) = service.exports.iter().find(|(key, _)| !is_env_name(key)) {
            return Err(BearError::validation_field(
                format!("invalid environment name '{}' for {}", key, service.name),
                "exports",
            ));
        }
        commands.push(shell::sudo(&shell::write_file(
            &service.conf_path(),
            &render_conf(service, runlevels),
            Some(0o755),
        )));
    }

    if let Some(group) = &services.group_name {
        for command in GROUP_COMMANDS {
            let path = format!("/usr/bin/{}_{}", group, command);
            commands.push(shell::sudo(&shell::write_file(
                &path,
                &render_group_script(services, command),
                Some(0o755),
            )));
        }
    }

    Ok(commands)
}
