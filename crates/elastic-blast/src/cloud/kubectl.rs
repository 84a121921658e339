use serde::Deserialize;

use crate::Map;
use crate::cloud::{
    CloudError, CloudFuture, CloudResult, ClusterHandle, CommandRunner, ignore_not_found,
};
use crate::status::JobState;

fn kubectl(cluster: &ClusterHandle, arguments: &[&str]) -> Vec<String> {
    let mut command = vec![
        "kubectl".to_string(),
        "--context".to_string(),
        cluster.context.clone(),
    ];
    command.extend(arguments.iter().map(|a| a.to_string()));
    command
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<JobObject>,
}

#[derive(Deserialize)]
struct JobObject {
    metadata: ObjectMeta,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Deserialize, Default)]
struct JobStatus {
    #[serde(default)]
    active: u32,
    #[serde(default)]
    ready: u32,
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl JobStatus {
    fn has_condition(&self, kind: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.kind == kind && c.status == "True")
    }

    /// Jobs are submitted with `backoffLimit: 0`, so one failed pod fails the job.
    fn state(&self) -> JobState {
        if self.has_condition("Failed") || self.failed > 0 {
            JobState::Failed
        } else if self.has_condition("Complete") || self.succeeded > 0 {
            JobState::Succeeded
        } else if self.ready > 0 {
            JobState::Running
        } else {
            JobState::Pending
        }
    }
}

fn parse_json<'a, T: Deserialize<'a>>(command: &[String], output: &'a str) -> CloudResult<T> {
    serde_json::from_str(output).map_err(|e| CloudError::InvalidOutput {
        command: command.join(" "),
        message: e.to_string(),
    })
}

pub(crate) fn parse_job_state(command: &[String], output: &str) -> CloudResult<Option<JobState>> {
    if output.is_empty() {
        return Ok(None);
    }
    let job: JobObject = parse_json(command, output)?;
    Ok(Some(job.status.state()))
}

pub(crate) fn parse_job_list(command: &[String], output: &str) -> CloudResult<Map<String, JobState>> {
    if output.is_empty() {
        return Ok(Map::default());
    }
    let list: JobList = parse_json(command, output)?;
    Ok(list
        .items
        .into_iter()
        .map(|job| (job.metadata.name, job.status.state()))
        .collect())
}

/// `kubectl apply` with the manifest passed on stdin.
pub fn apply(runner: CommandRunner, cluster: ClusterHandle, manifest: String) -> CloudFuture<()> {
    Box::pin(async move {
        runner
            .run_with_input(kubectl(&cluster, &["apply", "-f", "-"]), manifest)
            .await?;
        Ok(())
    })
}

pub fn delete(
    runner: CommandRunner,
    cluster: ClusterHandle,
    kind: &'static str,
    name: String,
) -> CloudFuture<()> {
    Box::pin(async move {
        let command = kubectl(
            &cluster,
            &["delete", kind, &name, "--ignore-not-found=true", "--wait=false"],
        );
        ignore_not_found(runner.run(command).await)
    })
}

pub fn get_job(
    runner: CommandRunner,
    cluster: ClusterHandle,
    name: String,
) -> CloudFuture<Option<JobState>> {
    Box::pin(async move {
        let command = kubectl(
            &cluster,
            &["get", "job", &name, "-o", "json", "--ignore-not-found=true"],
        );
        let output = runner.run(command.clone()).await?;
        parse_job_state(&command, &output)
    })
}

pub fn list_jobs(
    runner: CommandRunner,
    cluster: ClusterHandle,
    selector: String,
) -> CloudFuture<Map<String, JobState>> {
    Box::pin(async move {
        let command = kubectl(&cluster, &["get", "jobs", "-l", &selector, "-o", "json"]);
        let output = runner.run(command.clone()).await?;
        parse_job_list(&command, &output)
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_job_list, parse_job_state};
    use crate::status::JobState;

    #[test]
    fn test_parse_job_states() {
        let cmd = vec!["kubectl".to_string()];
        let state = |json: &str| parse_job_state(&cmd, json).unwrap().unwrap();

        assert_eq!(
            state(r#"{"metadata": {"name": "a"}, "status": {"active": 1}}"#),
            JobState::Pending
        );
        assert_eq!(
            state(r#"{"metadata": {"name": "a"}, "status": {"active": 1, "ready": 1}}"#),
            JobState::Running
        );
        assert_eq!(
            state(
                r#"{"metadata": {"name": "a"}, "status": {"succeeded": 1,
                "conditions": [{"type": "Complete", "status": "True"}]}}"#
            ),
            JobState::Succeeded
        );
        assert_eq!(
            state(
                r#"{"metadata": {"name": "a"}, "status": {"failed": 1,
                "conditions": [{"type": "Failed", "status": "True"}]}}"#
            ),
            JobState::Failed
        );
        assert_eq!(state(r#"{"metadata": {"name": "a"}}"#), JobState::Pending);
        assert_eq!(parse_job_state(&cmd, "").unwrap(), None);
        assert!(parse_job_state(&cmd, "not json").is_err());
    }

    #[test]
    fn test_parse_job_list() {
        let cmd = vec!["kubectl".to_string()];
        let jobs = parse_job_list(
            &cmd,
            r#"{"items": [
                {"metadata": {"name": "elb-1-batch-000"}, "status": {"succeeded": 1}},
                {"metadata": {"name": "elb-1-batch-001"}, "status": {"active": 1, "ready": 1}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs["elb-1-batch-000"], JobState::Succeeded);
        assert_eq!(jobs["elb-1-batch-001"], JobState::Running);
    }
}
