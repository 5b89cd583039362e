//! End-to-end orchestrator tests against a scripted provider and executor.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kiln_bake::{BakeError, Baker, catalogue};
use kiln_cloud::{
    CloudError, Endpoint, Image, MachineProvider, Resource, ResourceKind, ResourceTracker,
    WaitPolicy,
};
use kiln_config::ImageSpec;
use kiln_remote::{CommandOutcome, RemoteError, RemoteExecutor};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

fn spec(name: &str) -> ImageSpec {
    serde_json::from_str(&format!(
        r#"{{
            "name": "{name}",
            "description": "test image",
            "provider": "ec2",
            "region": "eu-central-1",
            "instance_type": "t3.micro",
            "base_image": {{"eu-central-1": "ami-123"}},
            "user": "ubuntu",
            "commands": ["cmd-one", "cmd-two", "cmd-three"]
        }}"#
    ))
    .unwrap()
}

/// Provider with scriptable failure points; records every call.
#[derive(Default)]
struct MockProvider {
    images: Mutex<Vec<Image>>,
    cleaned: Mutex<Vec<Resource>>,
    provision_calls: AtomicUsize,
    fail_endpoint_wait: bool,
    fail_capture: bool,
    fail_cleanup_handles: HashSet<String>,
    /// Simulates an interrupt arriving while the endpoint wait is in
    /// flight: the flag flips during the call, the orchestrator notices at
    /// the next step boundary.
    cancel_during_wait: Option<Arc<AtomicBool>>,
}

#[async_trait]
impl MachineProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(
        &self,
        _spec: &ImageSpec,
        tracker: &mut ResourceTracker,
    ) -> kiln_cloud::Result<Resource> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        tracker.register(Resource::new(ResourceKind::KeyPair, "key-1"));
        tracker.register(Resource::new(ResourceKind::SecurityGroup, "sg-1"));
        let instance = Resource::new(ResourceKind::Instance, "i-1");
        tracker.register(instance.clone());
        Ok(instance)
    }

    async fn wait_for_endpoint(
        &self,
        _machine: &Resource,
        spec: &ImageSpec,
        _policy: &WaitPolicy,
    ) -> kiln_cloud::Result<Endpoint> {
        if let Some(flag) = &self.cancel_during_wait {
            flag.store(true, Ordering::SeqCst);
        }
        if self.fail_endpoint_wait {
            return Err(CloudError::NetworkTimeout {
                waited_secs: 600,
                reason: "no address assigned".into(),
            });
        }
        Ok(Endpoint::new("198.51.100.7", &spec.user))
    }

    async fn capture(&self, _machine: &Resource, spec: &ImageSpec) -> kiln_cloud::Result<Image> {
        if self.fail_capture {
            return Err(CloudError::Capture("image stuck in pending".into()));
        }
        let image = Image::new("img-1", &spec.name).with_description(&spec.description);
        self.images.lock().unwrap().push(image.clone());
        Ok(image)
    }

    async fn cleanup(&self, resource: &Resource) -> kiln_cloud::Result<()> {
        self.cleaned.lock().unwrap().push(resource.clone());
        if self.fail_cleanup_handles.contains(&resource.handle) {
            return Err(CloudError::Api("backend refused".into()));
        }
        Ok(())
    }

    async fn list_images(&self) -> kiln_cloud::Result<Vec<Image>> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn get_image(&self, id: &str) -> kiln_cloud::Result<Image> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| CloudError::ImageNotFound(id.to_string()))
    }

    async fn delete_image(&self, id: &str) -> kiln_cloud::Result<()> {
        let mut images = self.images.lock().unwrap();
        let before = images.len();
        images.retain(|i| i.id != id);
        if images.len() == before {
            return Err(CloudError::ImageNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Executor that records submissions and fails at a chosen command index.
#[derive(Default)]
struct ScriptedExecutor {
    fail_at: Option<usize>,
    executed: Mutex<Vec<String>>,
    uploads_seen: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn wait_ready(&self, _endpoint: &Endpoint) -> kiln_remote::Result<()> {
        Ok(())
    }

    async fn upload(
        &self,
        _endpoint: &Endpoint,
        uploads: &BTreeMap<String, String>,
    ) -> kiln_remote::Result<()> {
        self.uploads_seen
            .lock()
            .unwrap()
            .extend(uploads.keys().cloned());
        Ok(())
    }

    async fn run_commands(
        &self,
        _endpoint: &Endpoint,
        commands: &[String],
    ) -> kiln_remote::Result<Vec<CommandOutcome>> {
        let mut outcomes = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            if self.fail_at == Some(i) {
                return Err(RemoteError::CommandFailed {
                    command: command.clone(),
                    exit_code: 1,
                    output: "boom\n".into(),
                    completed: outcomes,
                });
            }
            self.executed.lock().unwrap().push(command.clone());
            outcomes.push(CommandOutcome {
                command: command.clone(),
                exit_code: 0,
                output: String::new(),
            });
        }
        Ok(outcomes)
    }
}

fn cleaned_handles(provider: &MockProvider) -> Vec<String> {
    provider
        .cleaned
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.handle.clone())
        .collect()
}

#[tokio::test]
async fn test_successful_bake_releases_everything_and_leaves_one_image() {
    let provider = Arc::new(MockProvider::default());
    let executor = Arc::new(ScriptedExecutor::default());

    let image = Baker::new(provider.clone(), executor.clone(), spec("web-01"))
        .run()
        .await
        .unwrap();

    assert_eq!(image.name, "web-01");
    assert_eq!(image.description, "test image");
    // all three transient resources released, last created first
    assert_eq!(cleaned_handles(&provider), vec!["i-1", "sg-1", "key-1"]);
    // exactly one image remains
    let images = provider.list_images().await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(executor.executed.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_name_collision_provisions_nothing() {
    let provider = Arc::new(MockProvider::default());
    provider
        .images
        .lock()
        .unwrap()
        .push(Image::new("img-0", "web-01"));
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor, spec("web-01"))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BakeError::Validation(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(provider.provision_calls.load(Ordering::SeqCst), 0);
    assert!(provider.cleaned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_second_command_stops_run_and_cleans_up() {
    let provider = Arc::new(MockProvider::default());
    let executor = Arc::new(ScriptedExecutor {
        fail_at: Some(1),
        ..Default::default()
    });

    let err = Baker::new(provider.clone(), executor.clone(), spec("web-01"))
        .run()
        .await
        .unwrap_err();

    match &err {
        BakeError::Command {
            source: RemoteError::CommandFailed { command, exit_code, .. },
            ..
        } => {
            assert_eq!(command, "cmd-two");
            assert_eq!(*exit_code, 1);
        }
        other => panic!("expected Command error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);
    // third command never submitted
    assert_eq!(*executor.executed.lock().unwrap(), vec!["cmd-one"]);
    // everything provisioned was released
    assert_eq!(cleaned_handles(&provider), vec!["i-1", "sg-1", "key-1"]);
    // no image was captured
    assert!(provider.list_images().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_machine_routes_to_cleanup() {
    let provider = Arc::new(MockProvider {
        fail_endpoint_wait: true,
        ..Default::default()
    });
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor.clone(), spec("web-01"))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BakeError::NetworkTimeout { .. }), "got {err:?}");
    assert_eq!(cleaned_handles(&provider).len(), 3);
    assert!(executor.executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_capture_failure_keeps_primary_cause_and_cleans_up() {
    let provider = Arc::new(MockProvider {
        fail_capture: true,
        ..Default::default()
    });
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor, spec("web-01"))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BakeError::Capture { .. }), "got {err:?}");
    assert!(err.cleanup_error().is_none());
    assert_eq!(cleaned_handles(&provider).len(), 3);
}

#[tokio::test]
async fn test_cleanup_failure_stays_secondary() {
    let provider = Arc::new(MockProvider {
        fail_capture: true,
        fail_cleanup_handles: HashSet::from(["sg-1".to_string()]),
        ..Default::default()
    });
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor, spec("web-01"))
        .run()
        .await
        .unwrap_err();

    // capture failure is still the primary cause
    assert!(matches!(err, BakeError::Capture { .. }), "got {err:?}");
    let cleanup = err.cleanup_error().expect("cleanup failure attached");
    assert_eq!(cleanup.failures.len(), 1);
    assert_eq!(cleanup.failures[0].0.handle, "sg-1");
    // the failed release did not stop the rest
    assert_eq!(cleaned_handles(&provider).len(), 3);
}

#[tokio::test]
async fn test_successful_build_with_failed_cleanup_exits_4() {
    let provider = Arc::new(MockProvider {
        fail_cleanup_handles: HashSet::from(["key-1".to_string()]),
        ..Default::default()
    });
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor, spec("web-01"))
        .run()
        .await
        .unwrap_err();

    match &err {
        BakeError::CleanupOnly { image, cleanup } => {
            assert_eq!(image.name, "web-01");
            assert_eq!(cleanup.failures[0].0.handle, "key-1");
        }
        other => panic!("expected CleanupOnly, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);
    // the image itself survives
    assert_eq!(provider.list_images().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_interrupt_during_network_wait_releases_resources() {
    let cancel = Arc::new(AtomicBool::new(false));
    let provider = Arc::new(MockProvider {
        cancel_during_wait: Some(cancel.clone()),
        ..Default::default()
    });
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor.clone(), spec("web-01"))
        .with_cancel_flag(cancel)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BakeError::Interrupted { .. }), "got {err:?}");
    // the already-registered instance and ancillaries were released
    assert_eq!(cleaned_handles(&provider), vec!["i-1", "sg-1", "key-1"]);
    // configuration never started
    assert!(executor.executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupt_before_start_creates_nothing() {
    let cancel = Arc::new(AtomicBool::new(true));
    let provider = Arc::new(MockProvider::default());
    let executor = Arc::new(ScriptedExecutor::default());

    let err = Baker::new(provider.clone(), executor, spec("web-01"))
        .with_cancel_flag(cancel)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, BakeError::Interrupted { .. }));
    assert_eq!(provider.provision_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_catalogue_lists_oldest_first() {
    let provider = MockProvider::default();
    let mk = |id: &str, name: &str, secs: i64| {
        Image::new(id, name).with_created_at(Utc.timestamp_opt(secs, 0).unwrap())
    };
    {
        let mut images = provider.images.lock().unwrap();
        images.push(mk("img-2", "second", 2_000));
        images.push(mk("img-1", "first", 1_000));
        images.push(mk("img-3", "third", 3_000));
    }

    let listed = catalogue::list_images(&provider).await.unwrap();
    let names: Vec<_> = listed.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_catalogue_delete_unknown_id_is_not_found() {
    let provider = MockProvider::default();
    provider
        .images
        .lock()
        .unwrap()
        .push(Image::new("img-1", "keep-me"));

    let err = catalogue::delete_image(&provider, "img-404")
        .await
        .unwrap_err();

    assert!(matches!(err, CloudError::ImageNotFound(_)), "got {err:?}");
    // catalogue unchanged
    assert_eq!(provider.list_images().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_catalogue_info_round_trip() {
    let provider = MockProvider::default();
    provider.images.lock().unwrap().push(
        Image::new("img-1", "web-01").with_description("nginx builder"),
    );

    let image = catalogue::image_info(&provider, "img-1").await.unwrap();
    assert_eq!(image.name, "web-01");
    assert_eq!(image.description, "nginx builder");
}
