//! Finding a service that can run a job and handing the job to it.
use thiserror::Error;

use crate::{
    job::{Job, JobExecution, NotificationEndpoint, ProblemDetail},
    resource::{JobAssignment, ResourceError, ResourceManagerExt, Service},
};

use super::WorkerContext;

/// Why a job could not be handed to a service.
///
/// The message of each variant ends up in the `detail` of the job's error, so it never contains
/// the underlying transport failure. Sources are only logged.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to retrieve Job Profile '{id}'")]
    ProfileUnavailable {
        id: String,
        #[source]
        source: ResourceError,
    },
    #[error("Job is missing jobInput")]
    MissingInput,
    #[error("jobInput misses required input parameter '{0}'")]
    MissingParameter(String),
    #[error("Failed to retrieve the registered services")]
    ServicesUnavailable(#[source] ResourceError),
    #[error(
        "Failed to find service that could execute the {job_type} with Job Profile '{profile}'"
    )]
    NoCapableService { job_type: String, profile: String },
    #[error("Failed to post JobAssignment to Service '{service}' at endpoint: {endpoint}")]
    AssignmentFailed {
        service: String,
        endpoint: String,
        #[source]
        source: ResourceError,
    },
    #[error("Service '{service}' did not return the id of the created JobAssignment")]
    MissingAssignmentId { service: String },
}

impl DispatchError {
    pub fn to_problem(&self) -> ProblemDetail {
        ProblemDetail::new(ProblemDetail::JOB_START_FAILURE, "Failed to start job")
            .with_detail(self.to_string())
    }
}

/// Picks the first service of the job's type that exposes a job assignment endpoint and lists the
/// job's profile.
pub fn select_service<'a>(
    services: &'a [Service],
    job_type: &str,
    job_profile_id: &str,
) -> Option<(&'a Service, &'a str)> {
    services
        .iter()
        .filter(|service| service.job_type.as_deref() == Some(job_type))
        .filter_map(|service| Some((service, service.job_assignment_endpoint()?)))
        .find(|(service, _)| service.supports_profile(job_profile_id))
}

/// Validates the job against its profile, selects a service and creates the job assignment.
///
/// Returns the id of the created job assignment.
pub(crate) async fn dispatch(
    context: &WorkerContext,
    job: &Job,
    execution: &JobExecution,
) -> Result<String, DispatchError> {
    let resource_manager = context.resource_manager.as_ref();

    let profile = resource_manager
        .get_job_profile(&job.job_profile_id)
        .await
        .map_err(|source| DispatchError::ProfileUnavailable {
            id: job.job_profile_id.clone(),
            source,
        })?;

    let input = job.job_input.as_ref().ok_or(DispatchError::MissingInput)?;
    if let Some(missing) = profile
        .required_inputs()
        .find(|name| !input.contains_key(*name))
    {
        return Err(DispatchError::MissingParameter(missing.to_owned()));
    }

    let services = resource_manager
        .services()
        .await
        .map_err(DispatchError::ServicesUnavailable)?;
    let (service, endpoint) = select_service(&services, &job.job_type, &profile.id).ok_or_else(
        || DispatchError::NoCapableService {
            job_type: job.job_type.clone(),
            profile: profile.name.clone(),
        },
    )?;

    let assignment = JobAssignment {
        id: None,
        job_id: job.id.clone(),
        notification_endpoint: NotificationEndpoint {
            http_endpoint: format!("{}/notifications", execution.id),
        },
        tracker: job.tracker.clone(),
    };
    tracing::info!(service = %service.name, %endpoint, "Creating job assignment");

    let assignment_failed = |source| DispatchError::AssignmentFailed {
        service: service.name.clone(),
        endpoint: endpoint.to_owned(),
        source,
    };
    let body = serde_json::to_value(&assignment)
        .map_err(|err| assignment_failed(ResourceError::Decode(err)))?;
    let created = resource_manager
        .post(endpoint, &body)
        .await
        .inspect_err(|err| tracing::error!(?err, %endpoint, "Posting job assignment failed: {err}"))
        .map_err(assignment_failed)?;

    created
        .get("id")
        .and_then(serde_json::Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| DispatchError::MissingAssignmentId {
            service: service.name.clone(),
        })
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        job::{JobStatus, NewJob},
        testing::{self, FakeResourceManager},
        worker::test::context,
    };

    fn service(value: serde_json::Value) -> Service {
        Service::try_from(value).unwrap()
    }

    #[test]
    fn select_first_capable_service() {
        let services = vec![
            service(json!({ "name": "Other type", "jobType": "QAJob",
                "resources": [{ "resourceType": "JobAssignment", "httpEndpoint": "https://qa" }],
                "jobProfileIds": [testing::PROFILE_ID] })),
            service(json!({ "name": "No endpoint", "jobType": testing::JOB_TYPE,
                "jobProfileIds": [testing::PROFILE_ID] })),
            service(json!({ "name": "Other profile", "jobType": testing::JOB_TYPE,
                "resources": [{ "resourceType": "JobAssignment", "httpEndpoint": "https://other" }],
                "jobProfileIds": ["https://registry/job-profiles/other"] })),
            service(json!({ "name": "First", "jobType": testing::JOB_TYPE,
                "resources": [{ "resourceType": "JobAssignment", "httpEndpoint": "https://first" }],
                "jobProfileIds": [testing::PROFILE_ID] })),
            service(json!({ "name": "Second", "jobType": testing::JOB_TYPE,
                "resources": [
                    { "resourceType": "JobAssignment", "httpEndpoint": "https://second" }
                ],
                "jobProfileIds": [testing::PROFILE_ID] })),
        ];

        let (selected, endpoint) =
            select_service(&services, testing::JOB_TYPE, testing::PROFILE_ID).unwrap();
        assert_eq!(selected.name, "First");
        assert_eq!(endpoint, "https://first");

        assert!(select_service(&services, "Unknown", testing::PROFILE_ID).is_none());
    }

    async fn dispatch_new(
        resource_manager: FakeResourceManager,
        job: NewJob,
    ) -> Result<String, DispatchError> {
        let context = context(resource_manager);
        let job = context.repository.add_job(job).await.unwrap();
        let execution = context
            .repository
            .add_execution(&job.id, JobStatus::Pending)
            .await
            .unwrap();
        dispatch(&context, &job, &execution).await
    }

    #[tokio::test]
    async fn posts_assignment() {
        let resource_manager = FakeResourceManager::with_transform_service();
        let assignment_id = dispatch_new(resource_manager.clone(), NewJob::raw())
            .await
            .unwrap();

        assert_eq!(assignment_id, format!("{}/1", testing::ASSIGNMENT_ENDPOINT));
        let posts = resource_manager.posts();
        assert_eq!(posts.len(), 1);
        let (url, body) = &posts[0];
        assert_eq!(url, testing::ASSIGNMENT_ENDPOINT);
        assert!(body["notificationEndpoint"]["httpEndpoint"]
            .as_str()
            .unwrap()
            .ends_with("/executions/1/notifications"));
    }

    #[tokio::test]
    async fn missing_input() {
        let job = NewJob::new(testing::JOB_TYPE, testing::PROFILE_ID);
        let result = dispatch_new(FakeResourceManager::with_transform_service(), job).await;
        assert_matches!(result, Err(DispatchError::MissingInput));
    }

    #[tokio::test]
    async fn missing_required_parameter() {
        let job = NewJob::new(testing::JOB_TYPE, testing::PROFILE_ID).add_input("preset", "hd");
        let result = dispatch_new(FakeResourceManager::with_transform_service(), job).await;
        assert_matches!(result, Err(DispatchError::MissingParameter(name)) if name == "inputFile");
    }

    #[tokio::test]
    async fn unusable_descriptors_are_skipped() {
        let resource_manager = FakeResourceManager::new()
            .with_resource(testing::PROFILE_ID, testing::transcode_profile())
            .with_service(json!({ "jobType": testing::JOB_TYPE }))
            .with_service(testing::transform_service());

        assert!(dispatch_new(resource_manager, NewJob::raw()).await.is_ok());
    }

    #[tokio::test]
    async fn no_capable_service() {
        let resource_manager = FakeResourceManager::new()
            .with_resource(testing::PROFILE_ID, testing::transcode_profile());
        let result = dispatch_new(resource_manager, NewJob::raw()).await;

        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to find service that could execute the TransformJob with Job Profile \
            'Transcode'"
        );
        let problem = err.to_problem();
        assert_eq!(problem.problem_type, ProblemDetail::JOB_START_FAILURE);
        assert_eq!(problem.title, "Failed to start job");
    }

    #[tokio::test]
    async fn assignment_failure_hides_transport_details() {
        let resource_manager = FakeResourceManager::with_transform_service();
        resource_manager.fail_url(testing::ASSIGNMENT_ENDPOINT);
        let result = dispatch_new(resource_manager, NewJob::raw()).await;

        let err = result.unwrap_err();
        assert_matches!(err, DispatchError::AssignmentFailed { .. });
        assert_eq!(
            err.to_string(),
            format!(
                "Failed to post JobAssignment to Service 'Transform Service' at endpoint: {}",
                testing::ASSIGNMENT_ENDPOINT
            )
        );
    }

    #[tokio::test]
    async fn unknown_profile() {
        let result = dispatch_new(FakeResourceManager::new(), NewJob::raw()).await;
        assert_matches!(result, Err(DispatchError::ProfileUnavailable { .. }));
    }
}
