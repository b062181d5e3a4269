//! Procfile parsing and process-table fallbacks

use std::collections::BTreeMap;

use regex::Regex;

/// Process name used when an image only declares an entrypoint
pub const WEB_PROCESS: &str = "web";

const PROCFILE_LINE: &str = r"^([A-Za-z0-9_-]+):\s*(.+)$";

/// Parse Procfile text into a process table
///
/// Lines that are blank, comments or not `name: command` are skipped. A name
/// declared twice keeps its last command.
pub fn parse_procfile(content: &str) -> BTreeMap<String, String> {
    let mut processes = BTreeMap::new();
    let Ok(pattern) = Regex::new(PROCFILE_LINE) else {
        return processes;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = pattern.captures(line) {
            processes.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }
    processes
}

/// Build a web command line from an image entrypoint
///
/// The first token is kept as-is, every following token is quoted, so
/// `["python", "app.py"]` becomes `python "app.py"`.
pub fn command_from_entrypoint(entrypoint: &[String]) -> Option<String> {
    let (first, rest) = entrypoint.split_first()?;
    let mut command = first.clone();
    for arg in rest {
        command.push(' ');
        command.push_str(&format!("{:?}", arg));
    }
    Some(command)
}

/// Process table with a single web process running the entrypoint
pub fn processes_from_entrypoint(entrypoint: &[String]) -> Option<BTreeMap<String, String>> {
    let command = command_from_entrypoint(entrypoint)?;
    let mut processes = BTreeMap::new();
    processes.insert(WEB_PROCESS.to_string(), command);
    Some(processes)
}

/// Name of the process that receives external traffic
///
/// A single process is the web process whatever its name; otherwise it is the
/// one named `web`. Without a process table the answer is `web`.
pub fn web_process_name(processes: &BTreeMap<String, String>) -> String {
    if processes.len() == 1 {
        if let Some(name) = processes.keys().next() {
            return name.clone();
        }
    }
    WEB_PROCESS.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_procfile() {
        let content = "web: gunicorn app:wsgi --bind 0.0.0.0:$PORT\nworker:  celery -A tasks worker\n";
        let processes = parse_procfile(content);

        assert_eq!(processes.len(), 2);
        assert_eq!(
            processes.get("web").map(String::as_str),
            Some("gunicorn app:wsgi --bind 0.0.0.0:$PORT")
        );
        assert_eq!(
            processes.get("worker").map(String::as_str),
            Some("celery -A tasks worker")
        );
    }

    #[test]
    fn test_parse_procfile_skips_noise() {
        let content = "# comment\n\nnot a process line\nweb: ./run\nweb: ./run --fast\n";
        let processes = parse_procfile(content);

        assert_eq!(processes.len(), 1);
        assert_eq!(processes.get("web").map(String::as_str), Some("./run --fast"));
    }

    #[test]
    fn test_parse_empty_procfile() {
        assert!(parse_procfile("").is_empty());
    }

    #[test]
    fn test_entrypoint_fallback() {
        let entrypoint = vec!["python".to_string(), "app.py".to_string()];
        let processes = processes_from_entrypoint(&entrypoint).unwrap();
        assert_eq!(
            processes.get("web").map(String::as_str),
            Some("python \"app.py\"")
        );

        let entrypoint = vec!["/bin/server".to_string()];
        assert_eq!(command_from_entrypoint(&entrypoint).as_deref(), Some("/bin/server"));

        assert!(processes_from_entrypoint(&[]).is_none());
    }

    #[test]
    fn test_web_process_name() {
        let mut processes = BTreeMap::new();
        assert_eq!(web_process_name(&processes), "web");

        processes.insert("api".to_string(), "./api".to_string());
        assert_eq!(web_process_name(&processes), "api");

        processes.insert("worker".to_string(), "./worker".to_string());
        assert_eq!(web_process_name(&processes), "web");

        processes.insert("web".to_string(), "./web".to_string());
        assert_eq!(web_process_name(&processes), "web");
    }
}
