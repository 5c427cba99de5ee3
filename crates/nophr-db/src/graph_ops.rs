//! Social graph table operations.

use redb_bincode::{ReadTransaction, WriteTransaction};

use nophr_core::PubkeyKey;

use crate::{graph_nodes, Database, DbResult, GraphNodeRecord};

impl Database {
    /// Atomically replace the graph rooted at `root`.
    pub async fn replace_graph(
        &self,
        root: PubkeyKey,
        nodes: Vec<(PubkeyKey, GraphNodeRecord)>,
    ) -> DbResult<()> {
        self.write_with(move |tx| Self::replace_graph_tx(root, &nodes, tx))
            .await
    }

    pub fn replace_graph_tx(
        root: PubkeyKey,
        nodes: &[(PubkeyKey, GraphNodeRecord)],
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let mut table = tx.open_table(&graph_nodes::TABLE)?;

        let mut stale = Vec::new();
        for entry in table.range((root, PubkeyKey::ZERO)..)? {
            let entry = entry?;
            let key = entry.0.value();
            if key.0 != root {
                break;
            }
            stale.push(key);
        }
        for key in stale {
            table.remove(&key)?;
        }

        for (member, record) in nodes {
            table.insert(&(root, *member), record)?;
        }
        Ok(())
    }

    /// All members of the graph rooted at `root`.
    pub async fn graph_members(
        &self,
        root: PubkeyKey,
    ) -> DbResult<Vec<(PubkeyKey, GraphNodeRecord)>> {
        self.read_with(|tx| Self::graph_members_tx(root, tx)).await
    }

    pub fn graph_members_tx(
        root: PubkeyKey,
        tx: &ReadTransaction,
    ) -> DbResult<Vec<(PubkeyKey, GraphNodeRecord)>> {
        let table = tx.open_table(&graph_nodes::TABLE)?;
        let mut members = Vec::new();
        for entry in table.range((root, PubkeyKey::ZERO)..)? {
            let entry = entry?;
            let (owner, member) = entry.0.value();
            if owner != root {
                break;
            }
            members.push((member, entry.1.value()));
        }
        Ok(members)
    }

    /// Depth of `member` in the graph rooted at `root`.
    pub async fn social_distance(
        &self,
        root: PubkeyKey,
        member: PubkeyKey,
    ) -> DbResult<Option<u16>> {
        self.read_with(|tx| {
            let table = tx.open_table(&graph_nodes::TABLE)?;
            let result = table
                .get(&(root, member))?
                .map(|guard| guard.value().depth);
            Ok(result)
        })
        .await
    }
}
