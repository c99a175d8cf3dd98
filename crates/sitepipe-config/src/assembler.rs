//! The pipeline assembler.
//!
//! `assemble` is a pure function from a [`StackConfig`] to a
//! [`StackDefinition`]. It performs no I/O: the secret reference is only
//! recorded here and is resolved by the provisioner.

use crate::grants::build_role;
use crate::hosting::assemble_hosting;
use crate::stack::StackConfig;
use crate::ConfigResult;
use sitepipe_core::LogicalId;
use sitepipe_core::artifact::{ArtifactKind, ArtifactSlot};
use sitepipe_core::build::{BuildEnvironment, BuildProject, BuildSpecRef};
use sitepipe_core::pipeline::{
    Action, ActionKind, ApprovalAction, BuildAction, DeployAction, PipelineDefinition,
    SourceAction, Stage,
};
use sitepipe_core::secret::SecretRef;
use sitepipe_core::stack::{OutputValue, StackDefinition, StackOutput};
use tracing::{debug, info};

pub const BUILD_PROJECT_ID: &str = "CodeBuildMaster";
pub const SOURCE_ARTIFACT: &str = "SourceArtifact";
pub const WEBSITE_ARTIFACT: &str = "WebsiteArtifact";

pub const SOURCE_STAGE: &str = "Source";
pub const APPROVAL_STAGE: &str = "Approval";
pub const BUILD_STAGE: &str = "Build";
pub const DEPLOY_STAGE: &str = "Deploy";

/// Assemble the full stack definition for `config`.
///
/// The result has exactly four stages, Source, Approval, Build and
/// Deploy, each with one action.
pub fn assemble(config: &StackConfig) -> ConfigResult<StackDefinition> {
    config.validate()?;

    let mut role = build_role(config.policy.as_deref())?;
    let role_ref = role.without_policy_updates();

    let build_project = BuildProject {
        logical_id: LogicalId::new(BUILD_PROJECT_ID),
        build_spec: BuildSpecRef::from_source_filename(&config.build.buildspec),
        role: role_ref,
        environment: BuildEnvironment {
            build_image: config.build.image.clone(),
        },
    };

    let hosting = assemble_hosting(&config.name, &config.site)?;

    let source_artifact = ArtifactSlot::new(SOURCE_ARTIFACT, ArtifactKind::Source);
    let website_artifact = ArtifactSlot::new(WEBSITE_ARTIFACT, ArtifactKind::Website);

    let mut oauth_token = SecretRef::new(&config.source.secret_id);
    if let Some(field) = &config.source.secret_field {
        oauth_token = oauth_token.with_json_field(field);
    }

    let stages = vec![
        single_action_stage(
            SOURCE_STAGE,
            &config.source.action_name,
            ActionKind::Source(SourceAction {
                owner: config.github.owner.clone(),
                repository: config.github.repository.clone(),
                branch: config.branch.clone(),
                oauth_token,
                trigger: config.source.trigger,
                output: source_artifact.id,
            }),
        ),
        single_action_stage(
            APPROVAL_STAGE,
            &config.approval.action_name,
            ActionKind::ManualApproval(ApprovalAction {
                additional_information: config.approval.message.clone(),
            }),
        ),
        single_action_stage(
            BUILD_STAGE,
            &config.build.action_name,
            ActionKind::Build(BuildAction {
                project: build_project.logical_id.clone(),
                input: source_artifact.id,
                outputs: vec![website_artifact.id],
                environment_variables: config.build_variables(),
            }),
        ),
        single_action_stage(
            DEPLOY_STAGE,
            &config.deploy.action_name,
            ActionKind::Deploy(DeployAction {
                bucket: hosting.bucket.logical_id.clone(),
                input: website_artifact.id,
            }),
        ),
    ];

    let pipeline = PipelineDefinition {
        name: config.pipeline_name.clone(),
        restart_execution_on_update: config.restart_execution_on_update,
        artifacts: vec![source_artifact, website_artifact],
        stages,
    };

    let outputs = vec![StackOutput {
        logical_id: config.output.logical_id.clone(),
        value: OutputValue::DistributionDomainName(hosting.distribution.logical_id.clone()),
        export_name: config.output.export_name.clone(),
    }];

    let definition = StackDefinition {
        name: config.name.clone(),
        pipeline,
        build_role: role,
        build_project,
        bucket: hosting.bucket,
        origin_access_identity: hosting.origin_access_identity,
        distribution: hosting.distribution,
        outputs,
    };
    definition.validate()?;

    debug!(fingerprint = %definition.fingerprint(), "Stack definition fingerprint");
    info!(
        stack = %definition.name,
        pipeline = %definition.pipeline.name,
        repository = %format!("{}/{}", config.github.owner, config.github.repository),
        branch = %config.branch,
        "Assembled stack definition"
    );

    Ok(definition)
}

fn single_action_stage(stage: &str, action: &str, kind: ActionKind) -> Stage {
    Stage {
        name: stage.to_string(),
        actions: vec![Action {
            name: action.to_string(),
            run_order: 1,
            kind,
        }],
    }
}
