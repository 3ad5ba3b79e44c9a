// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Nesting structure of a decision instance.
//!
//! Nests form a forest whose roots are attached to an implicit root with a theta of one.
//! Alternatives without nest are children of the implicit root.
use hashbrown::HashMap;

use crate::alternative::AlternativeHandle;
use crate::coefficients::CoefficientStore;
use crate::ChoiceError;

/// Handle to a nest of the current decision instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NestHandle {
    pub(crate) index: usize,
    pub(crate) instance: u64,
}

/// A node that can be attached under a nest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeRef {
    Alternative(AlternativeHandle),
    Nest(NestHandle),
}

impl From<AlternativeHandle> for NodeRef {
    fn from(value: AlternativeHandle) -> Self {
        NodeRef::Alternative(value)
    }
}

impl From<NestHandle> for NodeRef {
    fn from(value: NestHandle) -> Self {
        NodeRef::Nest(value)
    }
}

/// Internal node of the nesting tree.
#[derive(Clone, Debug)]
pub struct NestNode {
    pub(crate) id: usize,
    pub(crate) position: usize,
    pub(crate) theta_coefficient: usize,
    pub(crate) theta: f64,
    pub(crate) parent: Option<usize>,
}

impl NestNode {
    /// Returns the identifier of the nest.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the position of the nest among the nests of its parent.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the index of the coefficient giving the theta of the nest.
    pub fn theta_coefficient(&self) -> usize {
        self.theta_coefficient
    }

    /// Returns the structural parameter of the nest.
    pub fn theta(&self) -> f64 {
        self.theta
    }
}

/// Set of nests of a decision instance.
#[derive(Clone, Debug, Default)]
pub(crate) struct NestTree {
    nests: Vec<NestNode>,
    ids: HashMap<usize, usize>,
}

impl NestTree {
    pub fn clear(&mut self) {
        self.nests.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.nests.len()
    }

    pub fn get(&self, index: usize) -> &NestNode {
        &self.nests[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NestNode> {
        self.nests.iter()
    }

    /// Returns the index of the nest with the given id, creating it if needed.
    ///
    /// In estimation mode, the theta is not read from the coefficients and is set to one.
    pub fn get_or_create(
        &mut self,
        id: usize,
        position: usize,
        theta_coefficient: usize,
        coefficients: &CoefficientStore,
        estimation_mode: bool,
    ) -> Result<usize, ChoiceError> {
        if let Some(&index) = self.ids.get(&id) {
            let nest = &self.nests[index];
            if nest.theta_coefficient != theta_coefficient {
                return Err(ChoiceError::NestThetaMismatch {
                    nest: id,
                    previous: nest.theta_coefficient,
                    given: theta_coefficient,
                });
            }
            return Ok(index);
        }
        let theta = if estimation_mode {
            1.0
        } else {
            coefficients.value(theta_coefficient)?
        };
        if !(theta.is_finite() && theta > 0.0) {
            return Err(ChoiceError::InvalidTheta {
                nest: id,
                coefficient: theta_coefficient,
                value: theta,
            });
        }
        let index = self.nests.len();
        self.nests.push(NestNode {
            id,
            position,
            theta_coefficient,
            theta,
            parent: None,
        });
        self.ids.insert(id, index);
        Ok(index)
    }

    /// Attaches the nest `child` under the nest `parent`.
    pub fn link(&mut self, child: usize, parent: usize) -> Result<(), ChoiceError> {
        match self.nests[child].parent {
            Some(previous) if previous == parent => return Ok(()),
            Some(previous) => {
                return Err(ChoiceError::NestParentConflict {
                    node: format!("Nest {}", self.nests[child].id),
                    previous: self.nests[previous].id,
                    given: self.nests[parent].id,
                })
            }
            None => (),
        }
        // The link creates a cycle iff `child` is `parent` or one of its ancestors.
        let mut current = Some(parent);
        while let Some(node) = current {
            if node == child {
                return Err(ChoiceError::NestCycle {
                    child: self.nests[child].id,
                    parent: self.nests[parent].id,
                });
            }
            current = self.nests[node].parent;
        }
        self.nests[child].parent = Some(parent);
        Ok(())
    }

    /// Returns the nests in the order they must be evaluated: children before parents.
    pub fn bottom_up_order(&self) -> Vec<usize> {
        let depths: Vec<usize> = (0..self.nests.len()).map(|i| self.depth(i)).collect();
        let mut order: Vec<usize> = (0..self.nests.len()).collect();
        order.sort_by_key(|&i| {
            (
                std::cmp::Reverse(depths[i]),
                self.nests[i].position,
                self.nests[i].id,
            )
        });
        order
    }

    fn depth(&self, mut index: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nests[index].parent {
            depth += 1;
            index = parent;
        }
        depth
    }
}
