// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Writer of the operational database. Changes are applied under the
//! `DbTable` identity and then notified to flow management, in order.

use flow_mgmt::key::{InetRouteKey, VrfId};
use flow_mgmt::{FlowMgmtKey, FlowMgmtRequest, RouteTableType};
use hashbrown::HashMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::VrfConfig;
use crate::errors::AgentError;
use crate::flow_mgmt_task::FlowMgmtSender;
use crate::oper_db::InMemoryOperDb;
use crate::task::{TaskGate, TaskId};

pub struct DbTable {
    db: Arc<InMemoryOperDb>,
    flow_mgmt: FlowMgmtSender,
    gate: Arc<TaskGate>,
    // generation of every object in the database
    gens: HashMap<FlowMgmtKey, u32>,
    next_gen: u32,
}

fn route_key(vrf: VrfId, prefix: IpNet) -> Result<FlowMgmtKey, AgentError> {
    let key = InetRouteKey::new(vrf, prefix.network(), prefix.prefix_len())?;
    Ok(FlowMgmtKey::InetRoute(key))
}

impl DbTable {
    #[must_use]
    pub fn new(db: Arc<InMemoryOperDb>, flow_mgmt: FlowMgmtSender, gate: Arc<TaskGate>) -> Self {
        Self {
            db,
            flow_mgmt,
            gate,
            gens: HashMap::new(),
            next_gen: 0,
        }
    }

    #[must_use]
    pub fn db(&self) -> &Arc<InMemoryOperDb> {
        &self.db
    }

    fn add_gen(&mut self, key: FlowMgmtKey) -> u32 {
        let gen_id = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);
        self.gens.insert(key, gen_id);
        gen_id
    }

    fn delete_gen(&mut self, key: &FlowMgmtKey) -> u32 {
        self.gens.remove(key).unwrap_or(self.next_gen)
    }

    pub async fn add_vrf(&mut self, vrf: VrfId) -> Result<(), AgentError> {
        {
            let _guard = self.gate.enter(TaskId::DbTable).await;
            self.db.add_vrf(vrf);
        }
        let key = FlowMgmtKey::Vrf(vrf);
        let gen_id = self.add_gen(key);
        self.flow_mgmt
            .request(FlowMgmtRequest::add(key, gen_id))
            .await
    }

    /// Delete a VRF: its routes go first, then the VRF and its route tables
    pub async fn delete_vrf(&mut self, vrf: VrfId) -> Result<(), AgentError> {
        let routes = {
            let _guard = self.gate.enter(TaskId::DbTable).await;
            let routes = self.db.routes(vrf);
            self.db.delete_vrf(vrf);
            routes
        };
        debug!("Vrf {vrf} deleted with {} routes", routes.len());
        for prefix in routes {
            self.notify_route_delete(vrf, prefix).await?;
        }
        let key = FlowMgmtKey::Vrf(vrf);
        let gen_id = self.delete_gen(&key);
        self.flow_mgmt
            .request(FlowMgmtRequest::delete(key, gen_id))
            .await?;
        for table in [
            RouteTableType::Inet4,
            RouteTableType::Inet6,
            RouteTableType::Bridge,
        ] {
            self.flow_mgmt
                .request(FlowMgmtRequest::RouteTableDeleted { vrf, table })
                .await?;
        }
        Ok(())
    }

    pub async fn add_route(&mut self, vrf: VrfId, prefix: IpNet) -> Result<(), AgentError> {
        let prefix = prefix.trunc();
        let key = route_key(vrf, prefix)?;
        {
            let _guard = self.gate.enter(TaskId::DbTable).await;
            self.db.add_route(vrf, prefix);
        }
        let gen_id = self.add_gen(key);
        self.flow_mgmt
            .request(FlowMgmtRequest::add(key, gen_id))
            .await
    }

    pub async fn delete_route(&mut self, vrf: VrfId, prefix: IpNet) -> Result<(), AgentError> {
        let prefix = prefix.trunc();
        {
            let _guard = self.gate.enter(TaskId::DbTable).await;
            self.db.delete_route(vrf, prefix);
        }
        self.notify_route_delete(vrf, prefix).await
    }

    async fn notify_route_delete(&mut self, vrf: VrfId, prefix: IpNet) -> Result<(), AgentError> {
        let key = route_key(vrf, prefix)?;
        let gen_id = self.delete_gen(&key);
        self.flow_mgmt
            .request(FlowMgmtRequest::delete(key, gen_id))
            .await
    }

    pub async fn set_controllers(&self, controllers: Vec<IpAddr>) {
        let _guard = self.gate.enter(TaskId::DbTable).await;
        self.db.set_controllers(controllers);
    }

    /// Load the VRFs of the configuration, with their routes
    pub async fn apply(&mut self, vrfs: &[VrfConfig]) -> Result<(), AgentError> {
        for vrf in vrfs {
            self.add_vrf(vrf.id).await?;
            for prefix in &vrf.routes {
                self.add_route(vrf.id, *prefix).await?;
            }
            info!("Vrf {} loaded with {} routes", vrf.id, vrf.routes.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_mgmt_task::FlowMgmtMsg;
    use flow_mgmt::OperDb;
    use flow_mgmt::request::DbOperation;
    use tokio::sync::mpsc;

    fn setup() -> (DbTable, mpsc::Receiver<FlowMgmtMsg>) {
        let (tx, rx) = mpsc::channel(64);
        let table = DbTable::new(
            Arc::new(InMemoryOperDb::default()),
            FlowMgmtSender::from(tx),
            TaskGate::new(),
        );
        (table, rx)
    }

    type DbOp = Option<(DbOperation, FlowMgmtKey, u32)>;

    /// The database operations queued to flow management, `None` for others
    fn db_ops(rx: &mut mpsc::Receiver<FlowMgmtMsg>) -> Vec<DbOp> {
        let mut ops = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let FlowMgmtMsg::Request(request) = msg {
                ops.push(match request {
                    FlowMgmtRequest::DbEntry {
                        op, key, gen_id, ..
                    } => Some((op, key, gen_id)),
                    _ => None,
                });
            }
        }
        ops
    }

    #[tokio::test]
    async fn test_config_is_applied_and_notified() {
        let (mut table, mut rx) = setup();
        let prefix: IpNet = "10.1.2.3/24".parse().unwrap();
        table
            .apply(&[VrfConfig {
                id: 4,
                routes: vec![prefix],
            }])
            .await
            .unwrap();
        assert!(table.db().vrf_exists(4));
        assert_eq!(
            table.db().uc_route(4, "10.1.2.9".parse().unwrap()),
            Some(("10.1.2.0".parse().unwrap(), 24))
        );
        let route = route_key(4, prefix.trunc()).unwrap();
        assert_eq!(
            db_ops(&mut rx),
            vec![
                Some((DbOperation::Add, FlowMgmtKey::Vrf(4), 0)),
                Some((DbOperation::Add, route, 1))
            ]
        );
    }

    #[tokio::test]
    async fn test_vrf_delete_order() {
        let (mut table, mut rx) = setup();
        let prefix: IpNet = "10.1.0.0/16".parse().unwrap();
        table.add_vrf(4).await.unwrap();
        table.add_route(4, prefix).await.unwrap();
        db_ops(&mut rx);

        table.delete_vrf(4).await.unwrap();
        assert!(!table.db().vrf_exists(4));
        assert_eq!(
            db_ops(&mut rx),
            vec![
                Some((DbOperation::Delete, route_key(4, prefix).unwrap(), 1)),
                Some((DbOperation::Delete, FlowMgmtKey::Vrf(4), 0)),
                None,
                None,
                None
            ]
        );
    }
}
