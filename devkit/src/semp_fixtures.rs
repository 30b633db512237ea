/*!
Canned SEMP replies for decoder, scheduler and pump tests.
*/

/// A message VPN as it appears in `show message-vpn * detail`.
#[derive(Debug, Clone)]
pub struct VpnFixture {
    pub name: String,
    pub enabled: bool,
    pub operational: bool,
    pub locally_configured: bool,
    pub local_status: String,
    pub connections: u32,
}

impl VpnFixture {
    pub fn up(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            operational: true,
            locally_configured: true,
            local_status: "Up".to_string(),
            connections: 1,
        }
    }

    pub fn down(name: &str) -> Self {
        Self {
            operational: false,
            local_status: "Down".to_string(),
            ..Self::up(name)
        }
    }

    fn to_xml(&self) -> String {
        format!(
            "<vpn><name>{}</name><enabled>{}</enabled><operational>{}</operational>\
             <locally-configured>{}</locally-configured><local-status>{}</local-status>\
             <connections>{}</connections>\
             <event-configuration><publish-topic-format><smf>true</smf><mqtt>false</mqtt>\
             </publish-topic-format></event-configuration></vpn>",
            self.name, self.enabled, self.operational, self.locally_configured, self.local_status, self.connections
        )
    }
}

/// Builds `<rpc-reply>` documents the way an appliance sends them.
#[derive(Debug, Clone)]
pub struct SempReplyBuilder {
    semp_version: String,
    body: String,
    more_cookie: Option<String>,
    result_code: String,
}

impl SempReplyBuilder {
    pub fn new(semp_version: &str) -> Self {
        Self {
            semp_version: semp_version.to_string(),
            body: String::new(),
            more_cookie: None,
            result_code: "ok".to_string(),
        }
    }

    /// Raw XML placed inside `<rpc>`.
    pub fn body(mut self, xml: impl Into<String>) -> Self {
        self.body = xml.into();
        self
    }

    /// Follow-up request returned in `<more-cookie>`.
    pub fn more_cookie(mut self, request: impl Into<String>) -> Self {
        self.more_cookie = Some(request.into());
        self
    }

    pub fn result_code(mut self, code: &str) -> Self {
        self.result_code = code.to_string();
        self
    }

    pub fn build(&self) -> String {
        let mut xml = format!("<rpc-reply semp-version=\"{}\"><rpc>{}</rpc>", self.semp_version, self.body);
        if let Some(cookie) = &self.more_cookie {
            xml.push_str(&format!("<more-cookie>{cookie}</more-cookie>"));
        }
        xml.push_str(&format!("<execute-result code=\"{}\"/></rpc-reply>", self.result_code));
        xml
    }

    pub fn hostname(semp_version: &str, hostname: &str) -> String {
        Self::new(semp_version)
            .body(format!("<show><hostname><hostname>{hostname}</hostname></hostname></show>"))
            .build()
    }

    /// `activity` is the summary string for the primary and backup virtual
    /// routers, e.g. "Local Active" / "Mate Active".
    pub fn redundancy(semp_version: &str, mode: &str, primary: &str, backup: &str) -> String {
        Self::new(semp_version)
            .body(format!(
                "<show><redundancy><config-status>Enabled</config-status><redundancy-status>Up</redundancy-status>\
                 <redundancy-mode>{mode}</redundancy-mode><virtual-routers>\
                 <primary><status><activity>{primary}</activity><detail><activity-status>\
                 <summary>{primary}</summary></activity-status></detail></status></primary>\
                 <backup><status><activity>{backup}</activity><detail><activity-status>\
                 <summary>{backup}</summary></activity-status></detail></status></backup>\
                 </virtual-routers></redundancy></show>"
            ))
            .build()
    }

    pub fn message_spool(semp_version: &str, operational_status: &str) -> String {
        Self::new(semp_version)
            .body(format!(
                "<show><message-spool><message-spool-info><config-status>Enabled</config-status>\
                 <operational-status>{operational_status}</operational-status>\
                 <current-persist-usage>1.5</current-persist-usage></message-spool-info></message-spool></show>"
            ))
            .build()
    }

    /// One page of a VPN detail listing; `next` becomes the more-cookie.
    pub fn vpn_page(semp_version: &str, vpns: &[VpnFixture], next: Option<&str>) -> String {
        let records: String = vpns.iter().map(VpnFixture::to_xml).collect();
        let mut builder = Self::new(semp_version).body(format!("<show><message-vpn>{records}</message-vpn></show>"));
        if let Some(request) = next {
            builder = builder.more_cookie(request);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_cookie_and_result() {
        let xml = SempReplyBuilder::vpn_page(
            "soltr/9_0",
            &[VpnFixture::up("default")],
            Some("<rpc><show><message-vpn><vpn-name>*</vpn-name></message-vpn></show></rpc>"),
        );
        assert!(xml.starts_with("<rpc-reply semp-version=\"soltr/9_0\">"));
        assert!(xml.contains("<name>default</name>"));
        assert!(xml.contains("<more-cookie><rpc>"));
        assert!(xml.ends_with("<execute-result code=\"ok\"/></rpc-reply>"));
    }

    #[test]
    fn failing_result_code() {
        let xml = SempReplyBuilder::new("soltr/7_1").result_code("fail").build();
        assert!(xml.contains("code=\"fail\""));
    }
}
