//! Network-isolated compute topology behind a load balancer.
//!
//! [`NetworkTopologyBuilder::build`] runs seven steps in a fixed order, each
//! consuming what the previous ones produced:
//!
//! 1. isolated network across at least two availability zones, with an
//!    internet gateway for the public subnets and a NAT gateway per zone for
//!    the private ones
//! 2. compute cluster bound to the network
//! 3. front security group, open on the service port
//! 4. task definition with its execution role and log group
//! 5. back security group, derived from the front group
//! 6. service in private subnets behind the back group
//! 7. load balancer, listener and target group
//!
//! Security rules between tiers are never written by hand. A
//! [`BackSecurityGroup`] can only be derived from a [`FrontSecurityGroup`], and
//! a [`ComputeService`] can only be launched with a back group, so the order
//! 3 → 5 → 6 holds by construction.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::arn::{Environment, ResourceArn};
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::policy::{scope_to, IdentityRole, ServicePrincipal};
use crate::registry::RegistryRef;
use crate::template::{get_att, reference, Resource, Synthesize, Template};

pub const NETWORK_CIDR: &str = "10.100.0.0/16";

/// A load balancer needs subnets in at least this many zones.
pub const MIN_AVAILABILITY_ZONES: usize = 2;

const MAX_AVAILABILITY_ZONES: usize = 8;
const SUBNET_PREFIX_OCTETS: &str = "10.100";
const IDLE_TIMEOUT_SECS: u32 = 600;
const MAX_ELB_NAME: usize = 32;
const ANY_IPV4: &str = "0.0.0.0/0";

/// Image pull actions for the task execution role.
pub const IMAGE_PULL_ACTIONS: &[&str] = &[
    "ecr:BatchCheckLayerAvailability",
    "ecr:GetDownloadUrlForLayer",
    "ecr:BatchGetImage",
];

const LOG_WRITE_ACTIONS: &[&str] = &["logs:CreateLogStream", "logs:PutLogEvents"];

fn default_container_port() -> u16 {
    8080
}

fn default_desired_count() -> u32 {
    1
}

fn default_availability_zones() -> usize {
    MIN_AVAILABILITY_ZONES
}

fn default_cpu() -> u32 {
    256
}

fn default_memory_mib() -> u32 {
    512
}

fn default_log_stream_prefix() -> String {
    "app".to_string()
}

/// `[service]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_desired_count")]
    pub desired_count: u32,

    #[serde(default = "default_availability_zones")]
    pub availability_zones: usize,

    /// CPU units for the task.
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    #[serde(default = "default_log_stream_prefix")]
    pub log_stream_prefix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            container_port: default_container_port(),
            desired_count: default_desired_count(),
            availability_zones: default_availability_zones(),
            cpu: default_cpu(),
            memory_mib: default_memory_mib(),
            log_stream_prefix: default_log_stream_prefix(),
        }
    }
}

impl ServiceConfig {
    pub fn with_port(container_port: u16) -> Self {
        Self {
            container_port,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_port == 0 {
            return Err(BerthError::InvalidConfig(
                "service.container_port must be between 1 and 65535".to_string(),
            ));
        }
        if self.desired_count == 0 {
            return Err(BerthError::InvalidConfig(
                "service.desired_count must be at least 1".to_string(),
            ));
        }
        if self.availability_zones < MIN_AVAILABILITY_ZONES {
            return Err(BerthError::InvalidConfig(format!(
                "service.availability_zones must be at least {}",
                MIN_AVAILABILITY_ZONES
            )));
        }
        if self.availability_zones > MAX_AVAILABILITY_ZONES {
            return Err(BerthError::InvalidConfig(format!(
                "service.availability_zones must be at most {}",
                MAX_AVAILABILITY_ZONES
            )));
        }
        if self.cpu == 0 || self.memory_mib == 0 {
            return Err(BerthError::InvalidConfig(
                "service.cpu and service.memory_mib must be positive".to_string(),
            ));
        }
        if self.log_stream_prefix.trim().is_empty() {
            return Err(BerthError::InvalidConfig(
                "service.log_stream_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubnetKind {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub logical_id: String,
    pub kind: SubnetKind,
    pub availability_zone: String,
    pub cidr: String,
}

/// Where a subnet's default route leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

/// A per-subnet route table with its `0.0.0.0/0` route and association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    pub logical_id: String,
    pub subnet: String,
    pub default_route: String,
    pub association: String,
    pub target: RouteTarget,
}

impl RouteTable {
    fn allocate(scope: &mut Scope, subnet_id: &str, subnet: &Subnet, target: RouteTarget) -> Result<Self> {
        Ok(Self {
            logical_id: scope.resource(&format!("{}RouteTable", subnet_id))?,
            default_route: scope.resource(&format!("{}DefaultRoute", subnet_id))?,
            association: scope.resource(&format!("{}RouteTableAssociation", subnet_id))?,
            subnet: subnet.logical_id.clone(),
            target,
        })
    }
}

/// Outbound path for one zone's private subnet, placed in its public subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatGateway {
    pub logical_id: String,
    pub elastic_ip: String,
    pub subnet: String,
    pub availability_zone: String,
}

/// An isolated network with one public and one private subnet per zone.
///
/// Public subnets route to the internet gateway. Each private subnet routes
/// through the NAT gateway of its own zone, so tasks without a public address
/// can still reach the registry.
#[derive(Debug, Clone)]
pub struct IsolatedNetwork {
    logical_id: String,
    cidr: String,
    subnets: Vec<Subnet>,
    internet_gateway: String,
    gateway_attachment: String,
    nat_gateways: Vec<NatGateway>,
    route_tables: Vec<RouteTable>,
}

impl IsolatedNetwork {
    pub fn allocate(scope: &mut Scope, env: &Environment, id: &str, zones: usize) -> Result<Self> {
        if zones < MIN_AVAILABILITY_ZONES {
            return Err(BerthError::NetworkInvariant(format!(
                "network {} spans {} availability zone(s); a load balancer needs {}",
                id, zones, MIN_AVAILABILITY_ZONES
            )));
        }
        if zones > MAX_AVAILABILITY_ZONES {
            return Err(BerthError::InvalidConfig(format!(
                "network {} cannot span more than {} availability zones",
                id, MAX_AVAILABILITY_ZONES
            )));
        }
        let logical_id = scope.resource(id)?;
        let internet_gateway = scope.resource(&format!("{}InternetGateway", id))?;
        let gateway_attachment = scope.resource(&format!("{}GatewayAttachment", id))?;

        let mut subnets = Vec::with_capacity(zones * 2);
        let mut nat_gateways = Vec::with_capacity(zones);
        let mut route_tables = Vec::with_capacity(zones * 2);
        for (index, zone) in env.availability_zones(zones).into_iter().enumerate() {
            let public_id = format!("{}PublicSubnet{}", id, index + 1);
            let private_id = format!("{}PrivateSubnet{}", id, index + 1);
            let public = Subnet {
                logical_id: scope.resource(&public_id)?,
                kind: SubnetKind::Public,
                availability_zone: zone.clone(),
                cidr: subnet_cidr(index * 2),
            };
            let private = Subnet {
                logical_id: scope.resource(&private_id)?,
                kind: SubnetKind::Private,
                availability_zone: zone.clone(),
                cidr: subnet_cidr(index * 2 + 1),
            };
            let nat = NatGateway {
                logical_id: scope.resource(&format!("{}NatGateway", public_id))?,
                elastic_ip: scope.resource(&format!("{}Eip", public_id))?,
                subnet: public.logical_id.clone(),
                availability_zone: zone,
            };

            route_tables.push(RouteTable::allocate(
                scope,
                &public_id,
                &public,
                RouteTarget::InternetGateway(internet_gateway.clone()),
            )?);
            route_tables.push(RouteTable::allocate(
                scope,
                &private_id,
                &private,
                RouteTarget::NatGateway(nat.logical_id.clone()),
            )?);
            subnets.push(public);
            subnets.push(private);
            nat_gateways.push(nat);
        }

        Ok(Self {
            logical_id,
            cidr: NETWORK_CIDR.to_string(),
            subnets,
            internet_gateway,
            gateway_attachment,
            nat_gateways,
            route_tables,
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn cidr(&self) -> &str {
        &self.cidr
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn subnets_of(&self, kind: SubnetKind) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.kind == kind)
    }

    /// Distinct zones, in allocation order.
    pub fn availability_zones(&self) -> Vec<&str> {
        let mut zones: Vec<&str> = Vec::new();
        for subnet in &self.subnets {
            if !zones.contains(&subnet.availability_zone.as_str()) {
                zones.push(&subnet.availability_zone);
            }
        }
        zones
    }

    pub fn internet_gateway(&self) -> &str {
        &self.internet_gateway
    }

    pub fn nat_gateways(&self) -> &[NatGateway] {
        &self.nat_gateways
    }

    pub fn route_tables(&self) -> &[RouteTable] {
        &self.route_tables
    }

    /// The route table associated with `subnet`.
    pub fn route_table_for(&self, subnet: &Subnet) -> Option<&RouteTable> {
        self.route_tables.iter().find(|t| t.subnet == subnet.logical_id)
    }

    /// Public subnets reach the internet gateway; private subnets reach a NAT
    /// gateway in their own zone.
    pub fn verify_egress(&self) -> Result<()> {
        for subnet in &self.subnets {
            let table = self.route_table_for(subnet).ok_or_else(|| {
                BerthError::NetworkInvariant(format!(
                    "subnet {} has no route table",
                    subnet.logical_id
                ))
            })?;
            let routed = match (subnet.kind, &table.target) {
                (SubnetKind::Public, RouteTarget::InternetGateway(gateway)) => {
                    *gateway == self.internet_gateway
                }
                (SubnetKind::Private, RouteTarget::NatGateway(nat)) => self
                    .nat_gateways
                    .iter()
                    .any(|n| n.logical_id == *nat && n.availability_zone == subnet.availability_zone),
                _ => false,
            };
            if !routed {
                return Err(BerthError::NetworkInvariant(format!(
                    "{:?} subnet {} routes to {:?}",
                    subnet.kind, subnet.logical_id, table.target
                )));
            }
        }
        Ok(())
    }

    /// Default routes through the internet gateway; anything public-facing
    /// waits on these.
    fn public_routes(&self) -> impl Iterator<Item = &str> {
        self.route_tables
            .iter()
            .filter(|t| matches!(t.target, RouteTarget::InternetGateway(_)))
            .map(|t| t.default_route.as_str())
    }
}

fn subnet_cidr(block: usize) -> String {
    format!("{}.{}.0/20", SUBNET_PREFIX_OCTETS, block * 16)
}

impl Synthesize for IsolatedNetwork {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::EC2::VPC",
                json!({
                    "CidrBlock": self.cidr,
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                }),
            ),
        )?;
        for subnet in &self.subnets {
            template.add_resource(
                &subnet.logical_id,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": reference(&self.logical_id),
                        "CidrBlock": subnet.cidr,
                        "AvailabilityZone": subnet.availability_zone,
                        "MapPublicIpOnLaunch": subnet.kind == SubnetKind::Public,
                    }),
                ),
            )?;
        }

        template.add_resource(
            &self.internet_gateway,
            Resource::new("AWS::EC2::InternetGateway", json!({})),
        )?;
        template.add_resource(
            &self.gateway_attachment,
            Resource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({
                    "VpcId": reference(&self.logical_id),
                    "InternetGatewayId": reference(&self.internet_gateway),
                }),
            ),
        )?;

        for nat in &self.nat_gateways {
            template.add_resource(
                &nat.elastic_ip,
                Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" }))
                    .depends_on(self.gateway_attachment.clone()),
            )?;
            template.add_resource(
                &nat.logical_id,
                Resource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "AllocationId": get_att(&nat.elastic_ip, "AllocationId"),
                        "SubnetId": reference(&nat.subnet),
                    }),
                )
                .depends_on(self.gateway_attachment.clone()),
            )?;
        }

        for table in &self.route_tables {
            template.add_resource(
                &table.logical_id,
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({ "VpcId": reference(&self.logical_id) }),
                ),
            )?;
            template.add_resource(
                &table.association,
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": reference(&table.logical_id),
                        "SubnetId": reference(&table.subnet),
                    }),
                ),
            )?;
            let mut route = json!({
                "RouteTableId": reference(&table.logical_id),
                "DestinationCidrBlock": ANY_IPV4,
            });
            let route = match &table.target {
                RouteTarget::InternetGateway(gateway) => {
                    route["GatewayId"] = reference(gateway);
                    Resource::new("AWS::EC2::Route", route).depends_on(self.gateway_attachment.clone())
                }
                RouteTarget::NatGateway(nat) => {
                    route["NatGatewayId"] = reference(nat);
                    Resource::new("AWS::EC2::Route", route)
                }
            };
            template.add_resource(&table.default_route, route)?;
        }
        Ok(())
    }
}

/// A compute cluster bound to one network.
#[derive(Debug, Clone)]
pub struct ComputeCluster {
    logical_id: String,
    name: String,
    network: String,
    container_insights: bool,
}

impl ComputeCluster {
    pub fn bind(scope: &mut Scope, id: &str, network: &IsolatedNetwork) -> Result<Self> {
        Ok(Self {
            logical_id: scope.resource(id)?,
            name: format!("{}-cluster", scope.id()),
            network: network.logical_id.clone(),
            container_insights: true,
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn container_insights(&self) -> bool {
        self.container_insights
    }
}

/// Where ingress traffic may come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    AnyIpv4,
    /// Another group, by logical id.
    SecurityGroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

impl IngressRule {
    fn to_declaration(&self) -> Value {
        let mut rule = json!({
            "IpProtocol": "tcp",
            "FromPort": self.port,
            "ToPort": self.port,
            "Description": self.description,
        });
        match &self.peer {
            Peer::AnyIpv4 => rule["CidrIp"] = json!(ANY_IPV4),
            Peer::SecurityGroup(id) => rule["SourceSecurityGroupId"] = get_att(id, "GroupId"),
        }
        rule
    }
}

/// A network allow-list. Egress is unrestricted.
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    logical_id: String,
    description: String,
    network: String,
    ingress: Vec<IngressRule>,
}

impl SecurityGroup {
    fn new(scope: &mut Scope, id: &str, network: &IsolatedNetwork, description: String) -> Result<Self> {
        Ok(Self {
            logical_id: scope.resource(id)?,
            description,
            network: network.logical_id.clone(),
            ingress: Vec::new(),
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn ingress(&self) -> &[IngressRule] {
        &self.ingress
    }

    pub fn allows_any_source(&self) -> bool {
        self.ingress.iter().any(|r| r.peer == Peer::AnyIpv4)
    }
}

impl Synthesize for SecurityGroup {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": self.description,
                    "VpcId": reference(&self.network),
                    "SecurityGroupIngress": self.ingress.iter().map(IngressRule::to_declaration).collect::<Vec<_>>(),
                    "SecurityGroupEgress": [{
                        "CidrIp": ANY_IPV4,
                        "IpProtocol": "-1",
                        "Description": "Allow all outbound traffic",
                    }],
                }),
            ),
        )
    }
}

/// The public-facing group; the only one allowed an any-source rule.
#[derive(Debug, Clone)]
pub struct FrontSecurityGroup {
    group: SecurityGroup,
}

impl FrontSecurityGroup {
    /// Allocate the group with its sole ingress rule: any IPv4 source on `port`.
    pub fn open(scope: &mut Scope, id: &str, network: &IsolatedNetwork, port: u16) -> Result<Self> {
        check_port(port)?;
        let mut group = SecurityGroup::new(
            scope,
            id,
            network,
            format!("Public ingress on port {}", port),
        )?;
        group.ingress.push(IngressRule {
            peer: Peer::AnyIpv4,
            port,
            description: format!("Allow from anyone on port {}", port),
        });
        Ok(Self { group })
    }

    pub fn group(&self) -> &SecurityGroup {
        &self.group
    }

    pub fn logical_id(&self) -> &str {
        &self.group.logical_id
    }
}

/// The compute-tier group, reachable only from the front group.
#[derive(Debug, Clone)]
pub struct BackSecurityGroup {
    group: SecurityGroup,
}

impl BackSecurityGroup {
    /// Allocate the group with its sole ingress rule: source = `front`, `port`.
    pub fn derive_from(
        scope: &mut Scope,
        id: &str,
        network: &IsolatedNetwork,
        front: &FrontSecurityGroup,
        port: u16,
    ) -> Result<Self> {
        check_port(port)?;
        let mut group = SecurityGroup::new(
            scope,
            id,
            network,
            format!("Ingress from {} on port {}", front.logical_id(), port),
        )?;
        group.ingress.push(IngressRule {
            peer: Peer::SecurityGroup(front.logical_id().to_string()),
            port,
            description: "Allow inbound connections from the load balancer".to_string(),
        });
        Ok(Self { group })
    }

    pub fn group(&self) -> &SecurityGroup {
        &self.group
    }

    pub fn logical_id(&self) -> &str {
        &self.group.logical_id
    }
}

fn check_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(BerthError::InvalidConfig(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(())
}

/// The single container a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub log_group: String,
    pub log_stream_prefix: String,
}

/// Task definition, its execution role and its log group.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    logical_id: String,
    log_group_logical_id: String,
    family: String,
    cpu: u32,
    memory_mib: u32,
    container: ContainerDefinition,
    execution_role: IdentityRole,
    region: String,
}

impl TaskDefinition {
    pub fn define(
        scope: &mut Scope,
        env: &Environment,
        id: &str,
        image: &RegistryRef,
        config: &ServiceConfig,
    ) -> Result<Self> {
        check_port(config.container_port)?;
        let logical_id = scope.resource(id)?;
        let log_group_logical_id = scope.resource(&format!("{}Logs", id))?;
        let family = format!("{}-{}", scope.id(), id);
        let log_group = format!("/berth/{}", family.to_lowercase());
        let log_group_arn = env
            .arn("logs", &format!("log-group:{}", log_group))?
            .everything_under(':');

        let role_id = format!("{}ExecutionRole", scope.id());
        let container_name = format!("{}-container", scope.id());
        let execution_role = IdentityRole::new(
            scope,
            &role_id,
            &env.account,
            ServicePrincipal::ecs_tasks(),
            "execution",
        )?
        .with_statement(scope_to(IMAGE_PULL_ACTIONS, Some(image.arn()))?)
        .with_statement(scope_to(["ecr:GetAuthorizationToken"], None)?)
        .with_statement(scope_to(LOG_WRITE_ACTIONS, Some(&log_group_arn))?);

        Ok(Self {
            logical_id,
            log_group_logical_id,
            container: ContainerDefinition {
                name: container_name,
                image: image.image("latest"),
                port: config.container_port,
                log_group,
                log_stream_prefix: config.log_stream_prefix.clone(),
            },
            family,
            cpu: config.cpu,
            memory_mib: config.memory_mib,
            execution_role,
            region: env.region.clone(),
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn container(&self) -> &ContainerDefinition {
        &self.container
    }

    pub fn execution_role(&self) -> &IdentityRole {
        &self.execution_role
    }

    /// Identifier of the log group the container writes to.
    pub fn log_group_arn(&self, env: &Environment) -> Result<ResourceArn> {
        Ok(env
            .arn("logs", &format!("log-group:{}", self.container.log_group))?
            .everything_under(':'))
    }
}

impl Synthesize for TaskDefinition {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.execution_role.synthesize(template)?;
        template.add_resource(
            &self.log_group_logical_id,
            Resource::new(
                "AWS::Logs::LogGroup",
                json!({ "LogGroupName": self.container.log_group }),
            ),
        )?;
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::ECS::TaskDefinition",
                json!({
                    "Family": self.family,
                    "Cpu": self.cpu.to_string(),
                    "Memory": self.memory_mib.to_string(),
                    "NetworkMode": "awsvpc",
                    "RequiresCompatibilities": ["FARGATE"],
                    "RuntimePlatform": {
                        "CpuArchitecture": "X86_64",
                        "OperatingSystemFamily": "LINUX",
                    },
                    "ExecutionRoleArn": self.execution_role.arn_ref(),
                    "ContainerDefinitions": [{
                        "Name": self.container.name,
                        "Image": self.container.image,
                        "Essential": true,
                        "PortMappings": [{
                            "ContainerPort": self.container.port,
                            "Protocol": "tcp",
                        }],
                        "LogConfiguration": {
                            "LogDriver": "awslogs",
                            "Options": {
                                "awslogs-group": reference(&self.log_group_logical_id),
                                "awslogs-region": self.region,
                                "awslogs-stream-prefix": self.container.log_stream_prefix,
                            },
                        },
                    }],
                }),
            )
            .depends_on(self.execution_role.logical_id())
            .depends_on(self.log_group_logical_id.clone()),
        )
    }
}

/// A long-running service in the cluster's private subnets.
#[derive(Debug, Clone)]
pub struct ComputeService {
    logical_id: String,
    cluster: String,
    task_definition: String,
    container_name: String,
    port: u16,
    security_groups: Vec<String>,
    subnets: Vec<String>,
    assign_public_ip: bool,
    desired_count: u32,
}

impl ComputeService {
    /// Launch the service. Requires the back group, so it can only happen
    /// after step 5.
    pub fn launch(
        scope: &mut Scope,
        id: &str,
        cluster: &ComputeCluster,
        network: &IsolatedNetwork,
        task: &TaskDefinition,
        back: &BackSecurityGroup,
        desired_count: u32,
    ) -> Result<Self> {
        if desired_count == 0 {
            return Err(BerthError::InvalidConfig(
                "service must run at least one replica".to_string(),
            ));
        }
        Ok(Self {
            logical_id: scope.resource(id)?,
            cluster: cluster.logical_id.clone(),
            task_definition: task.logical_id.clone(),
            container_name: task.container.name.clone(),
            port: task.container.port,
            security_groups: vec![back.logical_id().to_string()],
            subnets: network
                .subnets_of(SubnetKind::Private)
                .map(|s| s.logical_id.clone())
                .collect(),
            assign_public_ip: false,
            desired_count,
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn security_groups(&self) -> &[String] {
        &self.security_groups
    }

    pub fn subnets(&self) -> &[String] {
        &self.subnets
    }

    pub fn assign_public_ip(&self) -> bool {
        self.assign_public_ip
    }

    pub fn desired_count(&self) -> u32 {
        self.desired_count
    }
}

/// Internet-facing application load balancer.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    logical_id: String,
    name: String,
    security_group: String,
    subnets: Vec<String>,
    idle_timeout_secs: u32,
    http2_enabled: bool,
}

impl LoadBalancer {
    pub fn front_facing(
        scope: &mut Scope,
        id: &str,
        network: &IsolatedNetwork,
        front: &FrontSecurityGroup,
    ) -> Result<Self> {
        let public: Vec<&Subnet> = network.subnets_of(SubnetKind::Public).collect();
        if public.len() < MIN_AVAILABILITY_ZONES {
            return Err(BerthError::NetworkInvariant(format!(
                "load balancer {} needs public subnets in {} zones, found {}",
                id,
                MIN_AVAILABILITY_ZONES,
                public.len()
            )));
        }
        let logical_id = scope.resource(id)?;
        Ok(Self {
            name: elb_name(scope.id(), &logical_id, "alb"),
            logical_id,
            security_group: front.logical_id().to_string(),
            subnets: public.iter().map(|s| s.logical_id.clone()).collect(),
            idle_timeout_secs: IDLE_TIMEOUT_SECS,
            http2_enabled: false,
        })
    }

    /// Attach an HTTP listener on `port` forwarding to `service`.
    pub fn listen(
        &self,
        scope: &mut Scope,
        network: &IsolatedNetwork,
        port: u16,
        service: &ComputeService,
    ) -> Result<(Listener, TargetGroup)> {
        check_port(port)?;
        let logical_id = scope.resource("TargetGroup")?;
        let target_group = TargetGroup {
            name: elb_name(scope.id(), &logical_id, "tg"),
            logical_id,
            port: service.port,
            network: network.logical_id.clone(),
            target_service: service.logical_id.clone(),
        };
        let listener = Listener {
            logical_id: scope.resource("HttpListener")?,
            load_balancer: self.logical_id.clone(),
            port,
            target_group: target_group.logical_id.clone(),
        };
        Ok((listener, target_group))
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn security_group(&self) -> &str {
        &self.security_group
    }

    pub fn subnets(&self) -> &[String] {
        &self.subnets
    }

    pub fn idle_timeout_secs(&self) -> u32 {
        self.idle_timeout_secs
    }

    pub fn http2_enabled(&self) -> bool {
        self.http2_enabled
    }
}

#[derive(Debug, Clone)]
pub struct Listener {
    logical_id: String,
    load_balancer: String,
    port: u16,
    target_group: String,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target_group(&self) -> &str {
        &self.target_group
    }
}

#[derive(Debug, Clone)]
pub struct TargetGroup {
    logical_id: String,
    name: String,
    port: u16,
    network: String,
    target_service: String,
}

impl TargetGroup {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target_service(&self) -> &str {
        &self.target_service
    }
}

/// Load balancer names are alphanumeric and hyphens, may not start or end
/// with a hyphen, and are at most 32 characters. A base with nothing usable
/// left falls back to the logical id, which is always alphanumeric.
fn elb_name(base: &str, fallback: &str, suffix: &str) -> String {
    let budget = MAX_ELB_NAME - suffix.len() - 1;
    let clean = |raw: &str| -> String {
        let kept: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        let head: String = kept.trim_start_matches('-').chars().take(budget).collect();
        head.trim_end_matches('-').to_string()
    };
    let mut head = clean(base);
    if head.is_empty() {
        head = clean(fallback);
    }
    format!("{}-{}", head, suffix)
}

/// The assembled topology.
#[derive(Debug, Clone)]
pub struct NetworkTopology {
    network: IsolatedNetwork,
    cluster: ComputeCluster,
    front: FrontSecurityGroup,
    task: TaskDefinition,
    back: BackSecurityGroup,
    service: ComputeService,
    load_balancer: LoadBalancer,
    listener: Listener,
    target_group: TargetGroup,
}

impl NetworkTopology {
    pub fn network(&self) -> &IsolatedNetwork {
        &self.network
    }

    pub fn cluster(&self) -> &ComputeCluster {
        &self.cluster
    }

    pub fn front_security_group(&self) -> &FrontSecurityGroup {
        &self.front
    }

    pub fn back_security_group(&self) -> &BackSecurityGroup {
        &self.back
    }

    pub fn task_definition(&self) -> &TaskDefinition {
        &self.task
    }

    pub fn service(&self) -> &ComputeService {
        &self.service
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn target_group(&self) -> &TargetGroup {
        &self.target_group
    }

    /// Re-check the security-group and routing invariants.
    pub fn verify(&self) -> Result<()> {
        let port = self.service.port;
        let front_id = self.front.logical_id();

        match self.back.group.ingress.as_slice() {
            [rule] if rule.peer == Peer::SecurityGroup(front_id.to_string()) && rule.port == port => {}
            rules => {
                return Err(BerthError::NetworkInvariant(format!(
                    "back group must have exactly one rule from {} on {}, found {:?}",
                    front_id, port, rules
                )));
            }
        }

        if self
            .front
            .group
            .ingress
            .iter()
            .any(|r| r.peer != Peer::AnyIpv4 || r.port != self.listener.port)
        {
            return Err(BerthError::NetworkInvariant(
                "front group may only open the public listener port".to_string(),
            ));
        }

        if self.service.security_groups != [self.back.logical_id().to_string()] {
            return Err(BerthError::NetworkInvariant(
                "service must run behind the back group only".to_string(),
            ));
        }
        if self.service.assign_public_ip {
            return Err(BerthError::NetworkInvariant(
                "service must not have a public address".to_string(),
            ));
        }
        if self.load_balancer.security_group != front_id {
            return Err(BerthError::NetworkInvariant(
                "load balancer must use the front group".to_string(),
            ));
        }
        if self.target_group.target_service != self.service.logical_id
            || self.target_group.port != port
            || self.listener.target_group != self.target_group.logical_id
        {
            return Err(BerthError::NetworkInvariant(
                "listener must forward to the service on its container port".to_string(),
            ));
        }
        self.network.verify_egress()?;
        if self.load_balancer.subnets.len() < MIN_AVAILABILITY_ZONES {
            return Err(BerthError::NetworkInvariant(
                "load balancer must span at least two public subnets".to_string(),
            ));
        }
        if self.network.availability_zones().len() < MIN_AVAILABILITY_ZONES {
            return Err(BerthError::NetworkInvariant(format!(
                "network must span at least {} zones",
                MIN_AVAILABILITY_ZONES
            )));
        }
        Ok(())
    }
}

impl Synthesize for NetworkTopology {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.network.synthesize(template)?;

        let insights = if self.cluster.container_insights {
            "enabled"
        } else {
            "disabled"
        };
        template.add_resource(
            &self.cluster.logical_id,
            Resource::new(
                "AWS::ECS::Cluster",
                json!({
                    "ClusterName": self.cluster.name,
                    "ClusterSettings": [{
                        "Name": "containerInsights",
                        "Value": insights,
                    }],
                }),
            ),
        )?;

        self.front.group.synthesize(template)?;
        self.task.synthesize(template)?;
        self.back.group.synthesize(template)?;

        let load_balancer = Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Name": self.load_balancer.name,
                "Scheme": "internet-facing",
                "Type": "application",
                "SecurityGroups": [get_att(&self.load_balancer.security_group, "GroupId")],
                "Subnets": self.load_balancer.subnets.iter().map(|s| reference(s)).collect::<Vec<_>>(),
                "LoadBalancerAttributes": [
                    { "Key": "idle_timeout.timeout_seconds", "Value": self.load_balancer.idle_timeout_secs.to_string() },
                    { "Key": "routing.http2.enabled", "Value": self.load_balancer.http2_enabled.to_string() },
                    { "Key": "deletion_protection.enabled", "Value": "false" },
                ],
            }),
        );
        let load_balancer = self
            .network
            .public_routes()
            .fold(load_balancer, |resource, route| resource.depends_on(route));
        template.add_resource(&self.load_balancer.logical_id, load_balancer)?;
        template.add_resource(
            &self.target_group.logical_id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::TargetGroup",
                json!({
                    "Name": self.target_group.name,
                    "Port": self.target_group.port,
                    "Protocol": "HTTP",
                    "ProtocolVersion": "HTTP1",
                    "TargetType": "ip",
                    "VpcId": reference(&self.target_group.network),
                }),
            ),
        )?;
        template.add_resource(
            &self.listener.logical_id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::Listener",
                json!({
                    "LoadBalancerArn": reference(&self.listener.load_balancer),
                    "Port": self.listener.port,
                    "Protocol": "HTTP",
                    "DefaultActions": [{
                        "Type": "forward",
                        "TargetGroupArn": reference(&self.listener.target_group),
                    }],
                }),
            ),
        )?;

        let public_ip = if self.service.assign_public_ip {
            "ENABLED"
        } else {
            "DISABLED"
        };
        template.add_resource(
            &self.service.logical_id,
            Resource::new(
                "AWS::ECS::Service",
                json!({
                    "Cluster": reference(&self.service.cluster),
                    "LaunchType": "FARGATE",
                    "DesiredCount": self.service.desired_count,
                    "TaskDefinition": reference(&self.service.task_definition),
                    "NetworkConfiguration": {
                        "AwsvpcConfiguration": {
                            "AssignPublicIp": public_ip,
                            "SecurityGroups": self.service.security_groups.iter().map(|g| get_att(g, "GroupId")).collect::<Vec<_>>(),
                            "Subnets": self.service.subnets.iter().map(|s| reference(s)).collect::<Vec<_>>(),
                        },
                    },
                    "LoadBalancers": [{
                        "ContainerName": self.service.container_name,
                        "ContainerPort": self.service.port,
                        "TargetGroupArn": reference(&self.target_group.logical_id),
                    }],
                }),
            )
            .depends_on(self.listener.logical_id.clone()),
        )
    }
}

/// Builds a [`NetworkTopology`] for one service image.
#[derive(Debug, Clone)]
pub struct NetworkTopologyBuilder {
    id: String,
    config: ServiceConfig,
}

impl NetworkTopologyBuilder {
    pub fn new(id: &str, config: ServiceConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
        }
    }

    pub fn build(self, parent: &mut Scope, env: &Environment, image: &RegistryRef) -> Result<NetworkTopology> {
        self.config.validate()?;
        let port = self.config.container_port;
        let mut scope = parent.child(&self.id)?;

        let network = IsolatedNetwork::allocate(&mut scope, env, "Vpc", self.config.availability_zones)?;
        debug!(step = 1, zones = network.availability_zones().len(), "Allocated isolated network");

        let cluster = ComputeCluster::bind(&mut scope, "Cluster", &network)?;
        debug!(step = 2, cluster = %cluster.name(), "Bound compute cluster");

        let front = FrontSecurityGroup::open(&mut scope, "LoadBalancerSecurityGroup", &network, port)?;
        debug!(step = 3, port = port, "Opened front security group");

        let task = TaskDefinition::define(&mut scope, env, "TaskDefinition", image, &self.config)?;
        debug!(step = 4, image = %task.container().image, "Defined task");

        let back = BackSecurityGroup::derive_from(&mut scope, "ServiceSecurityGroup", &network, &front, port)?;
        debug!(step = 5, source = %front.logical_id(), "Derived back security group");

        let service = ComputeService::launch(
            &mut scope,
            "Service",
            &cluster,
            &network,
            &task,
            &back,
            self.config.desired_count,
        )?;
        debug!(step = 6, replicas = service.desired_count(), "Launched service");

        let load_balancer = LoadBalancer::front_facing(&mut scope, "LoadBalancer", &network, &front)?;
        let (listener, target_group) = load_balancer.listen(&mut scope, &network, port, &service)?;
        debug!(step = 7, listener_port = listener.port(), "Attached load balancer");

        let topology = NetworkTopology {
            network,
            cluster,
            front,
            task,
            back,
            service,
            load_balancer,
            listener,
            target_group,
        };
        topology.verify()?;

        info!(
            topology = %self.id,
            port = port,
            image = %image.image("latest"),
            "Assembled network topology"
        );
        Ok(topology)
    }
}
