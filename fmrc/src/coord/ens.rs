use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use super::{CoordId, Coordinate};
use crate::{
    errors::{Error, Result},
    extio::{ExtendedAsyncRead, ExtendedAsyncWrite, Serialize},
};

/// An ensemble axis.
///
/// Unlike time and vertical axes, ensemble axes are compared exactly.
///
#[derive(Clone, Debug)]
pub struct EnsCoord {
    pub id: CoordId,
    pub name: String,

    /// Number of ensemble members
    pub members: usize,

    /// Product definition number for the ensemble
    pub pdn: i32,

    /// Type code of each member (control, perturbed, ...). Either empty or one per member.
    pub types: Vec<i32>,
}

impl EnsCoord {
    pub fn new<S: Into<String>>(name: S, members: usize, pdn: i32, types: Vec<i32>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            members,
            pdn,
            types,
        }
    }

    /// The coordinate with the most members. Ties go to the first.
    ///
    pub fn union<'a, I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a EnsCoord>,
    {
        let mut largest: Option<&EnsCoord> = None;
        for coord in coords {
            match largest {
                Some(current) if current.members >= coord.members => {}
                _ => largest = Some(coord),
            }
        }

        largest.cloned()
    }
}

impl Coordinate for EnsCoord {
    fn same_values(&self, other: &Self) -> bool {
        self.members == other.members && self.pdn == other.pdn && self.types == other.types
    }

    fn id(&self) -> CoordId {
        self.id
    }

    fn set_id(&mut self, id: CoordId) {
        self.id = id;
    }
}

#[async_trait]
impl Serialize for EnsCoord {
    async fn write_to(&self, stream: &mut (impl AsyncWrite + Unpin + Send)) -> Result<()> {
        stream.write_u32(self.id as u32).await?;
        stream.write_str(&self.name).await?;
        stream.write_u32(self.members as u32).await?;
        stream.write_i32(self.pdn).await?;
        stream.write_u32(self.types.len() as u32).await?;
        for code in &self.types {
            stream.write_i32(*code).await?;
        }

        Ok(())
    }

    async fn read_from(stream: &mut (impl AsyncRead + Unpin + Send)) -> Result<Self> {
        let id = stream.read_u32().await? as CoordId;
        let name = stream.read_str().await?;
        let members = stream.read_u32().await? as usize;
        let pdn = stream.read_i32().await?;
        let n_types = stream.read_len("type code").await?;
        if n_types != 0 && n_types != members {
            return Err(Error::BadCache(format!(
                "ensemble {name} has {members} members but {n_types} type codes"
            )));
        }
        let mut types = Vec::with_capacity(n_types);
        for _ in 0..n_types {
            types.push(stream.read_i32().await?);
        }

        Ok(Self {
            id,
            name,
            members,
            pdn,
            types,
        })
    }
}
