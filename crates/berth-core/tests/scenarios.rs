//! End-to-end construction scenarios across topologies.

use berth_core::network::ServiceConfig;
use berth_core::pipeline::{Action, ArtifactName, PipelineState, Stage};
use berth_core::{
    Assembly, BerthConfig, BerthError, Environment, ExportTable, NetworkTopologyBuilder,
    PipelineBuilder, RegistryRef, Scope, SourceReference, SourceToRegistryPipeline, Synthesize,
    Template, WiringError,
};

const CONFIG: &str = r#"
[app]
name = "Bookstore"
account = "123456789012"
region = "us-east-1"

[source]
owner_alias = "acme"
repo_name = "bookstore-service"
branch = "main"
auth_token_alias = "prod/github/accessToken"

[service]
container_port = 8080
"#;

fn env() -> Environment {
    Environment::new("123456789012", "us-east-1")
}

#[test]
fn listener_and_target_group_follow_container_port() {
    let config = BerthConfig::from_toml(CONFIG).unwrap();
    let assembly = Assembly::from_config(&config).unwrap();
    let service = assembly.service();

    assert_eq!(service.listener().port(), 8080);
    assert_eq!(service.target_group().port(), 8080);
    assert_eq!(
        service.target_group().target_service(),
        service.service().logical_id()
    );

    let template = &assembly
        .topologies()
        .iter()
        .find(|t| t.name == "BookstoreService")
        .unwrap()
        .template;
    let (_, listener) = template
        .resources_of_type("AWS::ElasticLoadBalancingV2::Listener")
        .next()
        .unwrap();
    assert_eq!(listener.properties["Port"], 8080);
    let (_, svc) = template.resources_of_type("AWS::ECS::Service").next().unwrap();
    assert_eq!(svc.properties["LoadBalancers"][0]["ContainerPort"], 8080);
}

#[test]
fn private_tasks_pull_through_nat_and_balancer_waits_on_internet_route() {
    let config = BerthConfig::from_toml(CONFIG).unwrap();
    let assembly = Assembly::from_config(&config).unwrap();
    let network = assembly.service().network();
    let template = &assembly
        .topologies()
        .iter()
        .find(|t| t.name == "BookstoreService")
        .unwrap()
        .template;

    let (gateway_id, _) = template
        .resources_of_type("AWS::EC2::InternetGateway")
        .next()
        .unwrap();
    assert_eq!(gateway_id, network.internet_gateway());
    let (_, attachment) = template
        .resources_of_type("AWS::EC2::VPCGatewayAttachment")
        .next()
        .unwrap();
    assert_eq!(attachment.properties["InternetGatewayId"]["Ref"], network.internet_gateway());

    for subnet in assembly.service().service().subnets() {
        let (_, association) = template
            .resources_of_type("AWS::EC2::SubnetRouteTableAssociation")
            .find(|(_, r)| r.properties["SubnetId"]["Ref"] == subnet.as_str())
            .unwrap();
        let table = association.properties["RouteTableId"]["Ref"].as_str().unwrap();
        let (_, route) = template
            .resources_of_type("AWS::EC2::Route")
            .find(|(_, r)| r.properties["RouteTableId"]["Ref"] == table)
            .unwrap();
        let nat = route.properties["NatGatewayId"]["Ref"].as_str().unwrap();
        assert_eq!(template.resource(nat).unwrap().resource_type, "AWS::EC2::NatGateway");
    }

    let lb = template
        .resource(assembly.service().load_balancer().logical_id())
        .unwrap();
    for route in &lb.depends_on {
        assert!(template.resource(route).unwrap().properties.get("GatewayId").is_some());
    }
}

#[test]
fn registry_is_shared_only_through_its_export() {
    let mut root = Scope::root("SourceBuild").unwrap();
    let source = SourceReference::new("acme", "svc", "main", "token").unwrap();
    let pipeline = SourceToRegistryPipeline::new(&mut root, &env(), "Svc", source, 3).unwrap();

    let mut exports = ExportTable::new();
    exports
        .publish(pipeline.registry().export_identifier())
        .unwrap();
    assert!(matches!(
        exports.publish(pipeline.registry().export_identifier()),
        Err(BerthError::DuplicateExport(_))
    ));

    let image = RegistryRef::from_export(&exports, "SvcEcrRepoArn").unwrap();
    assert_eq!(image.name(), "svc-repo");
    assert_eq!(image.arn(), pipeline.registry().arn());

    let mut service_root = Scope::root("Service").unwrap();
    let topology = NetworkTopologyBuilder::new("Svc", ServiceConfig::default())
        .build(&mut service_root, &env(), &image)
        .unwrap();
    let mut template = Template::new("service");
    topology.synthesize(&mut template).unwrap();
    assert_eq!(template.resources_of_type("AWS::ECR::Repository").count(), 0);
}

#[test]
fn dangling_artifact_fails_before_any_resource_exists() {
    let mut root = Scope::root("Broken").unwrap();
    let source = SourceReference::new("acme", "svc", "main", "token").unwrap();
    let reference = SourceToRegistryPipeline::new(&mut root, &env(), "Svc", source.clone(), 7).unwrap();
    let project = reference.build_project().unwrap().clone();
    let role = reference.pipeline().role().clone();
    let store = reference.pipeline().artifact_store().clone();

    let result = PipelineBuilder::new("Broken")
        .stage(
            Stage::new("Source", PipelineState::SourceFetched).action(Action::source(
                "Fetch",
                source,
                ArtifactName::new("source"),
            )),
        )
        .stage(
            Stage::new("Build", PipelineState::Published).action(Action::build(
                "Build",
                project,
                ArtifactName::new("src"),
            )),
        )
        .build(&mut root, role, store, None);

    match result {
        Err(BerthError::Wiring(WiringError::DanglingInput { artifact, .. })) => {
            assert_eq!(artifact, "src")
        }
        other => panic!("expected dangling input, got {:?}", other.map(|p| p.name().to_string())),
    }
}

#[test]
fn duplicate_construct_ids_are_rejected() {
    let mut root = Scope::root("SourceBuild").unwrap();
    let source = SourceReference::new("acme", "svc", "main", "token").unwrap();
    SourceToRegistryPipeline::new(&mut root, &env(), "Svc", source.clone(), 7).unwrap();
    assert!(matches!(
        SourceToRegistryPipeline::new(&mut root, &env(), "Svc", source, 7),
        Err(BerthError::DuplicateConstruct { .. })
    ));
}

#[test]
fn templates_serialize_in_provider_shape() {
    let config = BerthConfig::from_toml(CONFIG).unwrap();
    let assembly = Assembly::from_config(&config).unwrap();
    let json = assembly.topologies()[0].template.to_json_pretty().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["Resources"].is_object());
    assert_eq!(
        value["Outputs"]["BookstoreEcrRepoArn"]["Export"]["Name"],
        "BookstoreEcrRepoArn"
    );
    assert_eq!(
        value["Outputs"]["BookstoreEcrRepoArn"]["Description"],
        "Bookstore's ECR repo ARN"
    );
}
