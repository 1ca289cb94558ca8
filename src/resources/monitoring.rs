//! Prometheus integration
//!
//! Alerting rules, scrape RBAC, the metrics Service and the ServiceMonitor.
//! Skipped entirely on clusters without the Prometheus operator.

use super::rbac::{role_binding, rule};
use super::{apply, object_meta, ResourceContext};
use crate::config::{PROMETHEUS_LABEL_KEY, PROMETHEUS_LABEL_VALUE};
use crate::crd::{
    Endpoint, NamespaceSelector, PrometheusRule, PrometheusRuleSpec, Rule, RuleGroup,
    ServiceMonitor, ServiceMonitorSpec, TlsConfig,
};
use crate::error::Result;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::debug;

pub const RULE_NAME: &str = "prometheus-hpp-rules";
pub const MONITORING_ROLE_NAME: &str = "hostpath-provisioner-monitoring";
pub const METRICS_SERVICE_NAME: &str = "hpp-prometheus-metrics";
pub const SERVICE_MONITOR_NAME: &str = "service-monitor-hpp";
const PROMETHEUS_SERVICE_ACCOUNT: &str = "prometheus-k8s";
const METRICS_PORT_NAME: &str = "metrics";

pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    if !ctx.store.is_served::<PrometheusRule>().await? {
        debug!("PrometheusRule not served, skipping monitoring");
        return Ok(());
    }
    apply(ctx, prometheus_rule(ctx)).await?;
    apply(ctx, monitoring_role(ctx)).await?;
    let mut binding = role_binding(
        ctx,
        MONITORING_ROLE_NAME,
        PROMETHEUS_SERVICE_ACCOUNT,
        &ctx.config.monitoring_namespace,
    );
    binding.metadata.labels = Some(ctx.config.prometheus_labels());
    apply(ctx, binding).await?;
    apply(ctx, metrics_service(ctx)).await?;
    if ctx.store.is_served::<ServiceMonitor>().await? {
        apply(ctx, service_monitor(ctx)).await?;
    }
    Ok(())
}

fn alert(
    ctx: &ResourceContext,
    name: &str,
    expr: &str,
    for_: &str,
    summary: &str,
    health_impact: &str,
) -> Rule {
    Rule {
        alert: Some(name.to_string()),
        expr: expr.to_string(),
        for_: Some(for_.to_string()),
        annotations: BTreeMap::from([
            ("summary".to_string(), summary.to_string()),
            ("runbook_url".to_string(), ctx.config.runbook_url(name)),
        ]),
        labels: BTreeMap::from([
            ("severity".to_string(), "warning".to_string()),
            ("operator_health_impact".to_string(), health_impact.to_string()),
            ("kubernetes_operator_part_of".to_string(), "kubevirt".to_string()),
            (
                "kubernetes_operator_component".to_string(),
                "hostpath-provisioner-operator".to_string(),
            ),
        ]),
        ..Default::default()
    }
}

fn prometheus_rule(ctx: &ResourceContext) -> PrometheusRule {
    let rules = vec![
        Rule {
            record: Some("kubevirt_hpp_operator_up".to_string()),
            expr: format!(
                "sum(up{{namespace='{}', pod=~'hostpath-provisioner-operator-.*'}} or vector(0))",
                ctx.namespace
            ),
            ..Default::default()
        },
        alert(
            ctx,
            "HPPOperatorDown",
            "kubevirt_hpp_operator_up == 0",
            "5m",
            "Hostpath Provisioner operator is down",
            "critical",
        ),
        alert(
            ctx,
            "HPPNotReady",
            "kubevirt_hpp_cr_ready == 0",
            "5m",
            "Hostpath Provisioner is not available to use",
            "critical",
        ),
        alert(
            ctx,
            "HPPSharingPoolPathWithOS",
            "kubevirt_hpp_pool_path_shared_with_os == 1",
            "1m",
            "HPP pool path sharing a filesystem with OS, fix to prevent HPP PVs from causing disk pressure and affecting node operation",
            "warning",
        ),
    ];
    let mut rule = PrometheusRule::new(
        RULE_NAME,
        PrometheusRuleSpec {
            groups: vec![RuleGroup {
                name: "hpp.rules".to_string(),
                rules,
            }],
        },
    );
    rule.metadata = object_meta(RULE_NAME, Some(&ctx.namespace), ctx.config.prometheus_labels());
    rule
}

fn monitoring_role(ctx: &ResourceContext) -> Role {
    Role {
        metadata: object_meta(
            MONITORING_ROLE_NAME,
            Some(&ctx.namespace),
            ctx.config.prometheus_labels(),
        ),
        rules: Some(vec![rule(
            &[""],
            &["services", "endpoints", "pods"],
            &["get", "list", "watch"],
        )]),
    }
}

fn metrics_service(ctx: &ResourceContext) -> Service {
    Service {
        metadata: object_meta(
            METRICS_SERVICE_NAME,
            Some(&ctx.namespace),
            ctx.config.prometheus_labels(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                PROMETHEUS_LABEL_KEY.to_string(),
                PROMETHEUS_LABEL_VALUE.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_string()),
                port: 8080,
                target_port: Some(IntOrString::String(METRICS_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_monitor(ctx: &ResourceContext) -> ServiceMonitor {
    let mut labels = ctx.config.prometheus_labels();
    labels.insert("openshift.io/cluster-monitoring".to_string(), String::new());
    let mut monitor = ServiceMonitor::new(
        SERVICE_MONITOR_NAME,
        ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    PROMETHEUS_LABEL_KEY.to_string(),
                    PROMETHEUS_LABEL_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![ctx.namespace.clone()],
            }),
            endpoints: vec![Endpoint {
                port: Some(METRICS_PORT_NAME.to_string()),
                scheme: Some("http".to_string()),
                tls_config: Some(TlsConfig {
                    insecure_skip_verify: true,
                }),
            }],
        },
    );
    monitor.metadata = object_meta(SERVICE_MONITOR_NAME, Some(&ctx.namespace), labels);
    monitor
}
